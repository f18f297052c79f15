#[cfg(test)]
mod tests_impl {
    use crate::core::applier::{BackupSettings, RuleApplier};
    use crate::core::firewall::{Chain, Protocol, Target};
    use crate::core::memory::{ConnState, MemoryFilter, Packet};
    use crate::core::test_helpers::{backup_settings, policy_of};

    #[tokio::test]
    async fn test_deny_by_default_reachability() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = RuleApplier::new(MemoryFilter::new(), backup_settings(dir.path()));

        applier
            .apply_deny_by_default(&policy_of(&[(22, Protocol::Tcp), (80, Protocol::Tcp)]))
            .await
            .unwrap();
        let filter = applier.filter();

        // Loopback both ways
        assert!(filter.admits(&Packet::inbound(Protocol::Tcp, 5432).on_loopback()));
        assert!(filter.admits(&Packet::outbound(Protocol::Udp, 53).on_loopback()));

        // Established/related inbound
        assert!(
            filter.admits(&Packet::inbound(Protocol::Tcp, 40000).with_state(ConnState::Established))
        );
        assert!(filter.admits(&Packet::inbound(Protocol::Udp, 40001).with_state(ConnState::Related)));

        // Exactly the listed ports
        assert!(filter.admits(&Packet::inbound(Protocol::Tcp, 22)));
        assert!(filter.admits(&Packet::inbound(Protocol::Tcp, 80)));
        for port in [21, 23, 79, 81, 443, 9100, 65535] {
            assert!(!filter.admits(&Packet::inbound(Protocol::Tcp, port)), "{port}/tcp");
        }
        assert!(!filter.admits(&Packet::inbound(Protocol::Udp, 22)));

        // Forwarding denied, outbound unrestricted
        assert!(!filter.admits(&Packet::forwarded(Protocol::Tcp, 80)));
        assert!(filter.admits(&Packet::outbound(Protocol::Tcp, 443)));
        assert!(filter.admits(&Packet::outbound(Protocol::Udp, 123)));
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_of(&[(22, Protocol::Tcp), (80, Protocol::Tcp)]);

        let mut once = RuleApplier::new(MemoryFilter::new(), backup_settings(dir.path()));
        once.apply_deny_by_default(&policy).await.unwrap();

        let mut twice = RuleApplier::new(MemoryFilter::new(), backup_settings(dir.path()));
        twice.apply_deny_by_default(&policy).await.unwrap();
        twice.apply_deny_by_default(&policy).await.unwrap();

        assert_eq!(once.filter().rules(), twice.filter().rules());
        assert_eq!(
            twice.filter().accepted_ports(),
            vec![(22, Protocol::Tcp), (80, Protocol::Tcp)]
        );
    }

    #[tokio::test]
    async fn test_reset_opens_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = RuleApplier::new(
            MemoryFilter::new().with_custom_chain("f2b-sshd"),
            backup_settings(dir.path()),
        );
        applier
            .apply_deny_by_default(&policy_of(&[(22, Protocol::Tcp)]))
            .await
            .unwrap();

        applier.reset().await.unwrap();
        let filter = applier.filter();

        assert!(filter.is_fully_open());
        for chain in [Chain::Input, Chain::Forward, Chain::Output] {
            assert_eq!(filter.policy(chain), Target::Accept);
        }
        assert!(filter.admits(&Packet::inbound(Protocol::Tcp, 3306)));
    }

    #[tokio::test]
    async fn test_stale_rules_do_not_survive_apply() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = RuleApplier::new(MemoryFilter::new(), backup_settings(dir.path()));

        applier
            .apply_deny_by_default(&policy_of(&[(3306, Protocol::Tcp)]))
            .await
            .unwrap();
        applier
            .apply_deny_by_default(&policy_of(&[(22, Protocol::Tcp)]))
            .await
            .unwrap();

        assert!(!applier.filter().admits(&Packet::inbound(Protocol::Tcp, 3306)));
        assert!(applier.filter().admits(&Packet::inbound(Protocol::Tcp, 22)));
    }

    #[tokio::test]
    async fn test_dry_run_of_empty_list() {
        let applier = RuleApplier::new(MemoryFilter::new(), BackupSettings::default());
        let preview = applier.dry_run(&policy_of(&[])).await.unwrap();

        assert!(preview.ports.is_empty());
        assert!(preview.rules_text.contains(":INPUT DROP"));
        assert!(applier.filter().calls().is_empty());
    }
}

#[cfg(test)]
mod property_tests {
    use crate::core::applier::{BackupSettings, RuleApplier, preview};
    use crate::core::firewall::{FirewallPolicy, PortSpec, Protocol};
    use crate::core::memory::{MemoryFilter, Packet};
    use proptest::prelude::*;

    prop_compose! {
        fn arb_port_spec()(
            port in 1u16..=65535,
            protocol in prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp)],
        ) -> PortSpec {
            PortSpec::new(port, protocol)
        }
    }

    prop_compose! {
        fn arb_policy()(ports in proptest::collection::vec(arb_port_spec(), 0..12)) -> FirewallPolicy {
            FirewallPolicy::new(ports)
        }
    }

    fn block_on<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    proptest! {
        #[test]
        fn test_dry_run_never_mutates(policy in arb_policy()) {
            let applier = RuleApplier::new(MemoryFilter::new(), BackupSettings::default());
            let result = block_on(applier.dry_run(&policy)).unwrap();

            prop_assert_eq!(&result.ports, &policy.ports);
            prop_assert!(applier.filter().calls().is_empty());
        }

        #[test]
        fn test_preview_matches_rendered_policy(policy in arb_policy()) {
            let result = block_on(preview(&policy)).unwrap();
            prop_assert_eq!(result.rules_text, policy.to_rules_text());
        }

        #[test]
        fn test_only_listed_ports_reachable(policy in arb_policy(), candidate in arb_port_spec()) {
            let dir = tempfile::tempdir().unwrap();
            let mut applier = RuleApplier::new(
                MemoryFilter::new(),
                crate::core::test_helpers::backup_settings(dir.path()),
            );
            block_on(applier.apply_deny_by_default(&policy)).unwrap();

            let listed = policy.ports.contains(&candidate);
            let admitted = applier
                .filter()
                .admits(&Packet::inbound(candidate.protocol, candidate.port));
            prop_assert_eq!(listed, admitted);
        }

        #[test]
        fn test_steps_start_with_flush_and_end_with_ports(policy in arb_policy()) {
            use crate::core::firewall::{AcceptRule, PolicyStep};

            let steps = policy.steps();
            prop_assert_eq!(steps[0], PolicyStep::Flush);
            prop_assert_eq!(steps.len(), policy.ports.len() + 7);

            let tail: Vec<PolicyStep> = policy
                .ports
                .iter()
                .map(|spec| PolicyStep::Accept(AcceptRule::Port(*spec)))
                .collect();
            prop_assert_eq!(&steps[7..], tail.as_slice());
        }
    }
}
