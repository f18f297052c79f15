//! Build script for portwall
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for `portwall --version`.

fn main() {
    // Re-run build if the default iptables binary override changes
    println!("cargo:rerun-if-env-changed=PORTWALL_IPTABLES");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
