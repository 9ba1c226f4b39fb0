//! End-to-end verbs against a recording runner

use dhcpmgr::HostBinding;
use hostnet_common::HostnetError;
use hostnet_test::{config_fixtures, dump_fixtures, id_fixtures, DumpBuilder, RecordingRunner};
use hostnetd::{DhcpProvision, Orchestrator};
use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

/// Orchestrator keeping DHCP state, claims and sysfs under `root`
fn orchestrator(runner: Arc<RecordingRunner>, root: &Path) -> Orchestrator {
    Orchestrator::new(config_fixtures::agent_config(root), runner)
        .expect("test config is valid")
        .with_sysfs_root(root.join("sys"))
}

#[tokio::test]
async fn attach_port_with_security_group() {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new().with_iptables_dump(dump_fixtures::busy_host()));
    let orch = orchestrator(runner.clone(), root.path());

    orch.attach_port(id_fixtures::PORT_ID, id_fixtures::VLAN, true)
        .await
        .unwrap();

    let verifier = runner.verifier();
    verifier.assert_command_executed("/sbin/brctl addbr qbr-abcdefghij").unwrap();
    verifier
        .assert_command_executed("/sbin/ip link add qvb-abcdefghij type veth peer name qvo-abcdefghij")
        .unwrap();
    verifier
        .assert_command_executed("/sbin/brctl addif qbr-abcdefghij qvb-abcdefghij")
        .unwrap();
    verifier
        .assert_command_executed("set port qvo-abcdefghij tag=50")
        .unwrap();
    for dev in ["qbr-abcdefghij", "qvb-abcdefghij", "qvo-abcdefghij"] {
        verifier
            .assert_command_executed(&format!("/sbin/ip link set {} up", dev))
            .unwrap();
    }
    verifier
        .assert_command_executed("/sbin/ipset create -exist NIPv4abcdefghij hash:net")
        .unwrap();

    let dump = runner.iptables_dump(None);
    assert!(dump.contains(":hostnetd-iabcdefghij - [0:0]"));
    assert!(dump.contains(":hostnetd-oabcdefghij - [0:0]"));
    assert!(dump.contains("-A hostnetd-FORWARD -m physdev --physdev-in tapabcdefghij --physdev-is-bridged -j hostnetd-sg-chain"));
    assert!(dump.contains("-A hostnetd-sg-chain -m physdev --physdev-out tapabcdefghij --physdev-is-bridged -j hostnetd-iabcdefghij"));
    // Unrelated rules survive.
    assert!(dump.contains("-A LIBVIRT_INP -i virbr0 -p udp -m udp --dport 53 -j ACCEPT"));
    assert!(dump.contains("MASQUERADE"));
}

#[tokio::test]
async fn first_dhcp_provision_uses_network_namespace() {
    let root = tempfile::tempdir().unwrap();
    let state = root.path().join("dhcp");
    let runner = Arc::new(RecordingRunner::new().simulate_dnsmasq(4242));
    let orch = orchestrator(runner.clone(), root.path());

    let req = DhcpProvision {
        network: id_fixtures::NETWORK_ID.to_string(),
        block: "10.0.0.0/24".parse().unwrap(),
        vlan: id_fixtures::VLAN,
        host: None,
        namespace: None,
        first: true,
    };
    let pid = orch.provision_dhcp(&req).await.unwrap();
    assert_eq!(pid, 4242);

    let verifier = runner.verifier();
    verifier.assert_command_executed("/sbin/ip netns add qdhcp-net0000000").unwrap();
    verifier
        .assert_command_executed("add-port br0 dhcpnet0000000 tag=50 -- set interface dhcpnet0000000 type=internal")
        .unwrap();
    verifier
        .assert_command_executed("/sbin/ip link set dhcpnet0000000 netns qdhcp-net0000000")
        .unwrap();
    verifier
        .assert_command_executed("netns exec qdhcp-net0000000 /sbin/ip addr add 10.0.0.1/24 dev dhcpnet0000000")
        .unwrap();
    verifier.assert_command_executed("--interface=dhcpnet0000000").unwrap();
    verifier.assert_command_executed("--dhcp-option=3,10.0.0.254").unwrap();
    verifier.assert_command_not_executed("l3_ns-").unwrap();

    let bindings = std::fs::read_to_string(state.join("net0000000").join("host")).unwrap();
    assert_eq!(bindings, "");

    // A later provisioning only registers the host and reloads.
    runner.clear();
    let mac_binding = HostBinding::new(id_fixtures::MAC, Ipv4Addr::new(10, 0, 0, 5)).unwrap();
    let update = DhcpProvision {
        host: Some(mac_binding),
        first: false,
        ..req
    };
    assert_eq!(orch.provision_dhcp(&update).await.unwrap(), 4242);

    let verifier = runner.verifier();
    verifier.assert_command_executed("/bin/kill -s HUP 4242").unwrap();
    verifier.assert_command_not_executed("netns add").unwrap();
    verifier.assert_command_not_executed("dnsmasq").unwrap();
    let bindings = std::fs::read_to_string(state.join("net0000000").join("host")).unwrap();
    assert_eq!(bindings, "fa:16:3e:00:00:01,10.0.0.5\n");
}

#[tokio::test]
async fn dhcp_teardown_removes_state() {
    let root = tempfile::tempdir().unwrap();
    let state = root.path().join("dhcp");
    let runner = Arc::new(RecordingRunner::new().simulate_dnsmasq(77));
    let orch = orchestrator(runner.clone(), root.path());

    let req = DhcpProvision {
        network: id_fixtures::NETWORK_ID.to_string(),
        block: "10.0.0.0/24".parse().unwrap(),
        vlan: id_fixtures::VLAN,
        host: None,
        namespace: None,
        first: true,
    };
    orch.provision_dhcp(&req).await.unwrap();
    orch.teardown_dhcp(id_fixtures::NETWORK_ID, None).await.unwrap();

    let verifier = runner.verifier();
    verifier.assert_command_executed("del-port br0 dhcpnet0000000").unwrap();
    verifier.assert_command_executed("/sbin/ip netns delete qdhcp-net0000000").unwrap();
    verifier.assert_command_executed("/bin/kill -s KILL 77").unwrap();
    assert!(!state.join("net0000000").exists());
}

#[tokio::test]
async fn detach_of_unfinished_attach_still_cleans_firewall() {
    // The attach got as far as the chains; the Linux bridge and veth never
    // came up.
    let dump = DumpBuilder::new()
        .table("nat")
        .chain("PREROUTING", "ACCEPT")
        .chain("POSTROUTING", "ACCEPT")
        .table("filter")
        .chain("INPUT", "ACCEPT")
        .chain("FORWARD", "ACCEPT")
        .chain("OUTPUT", "ACCEPT")
        .chain("hostnetd-FORWARD", "-")
        .chain("hostnetd-sg-chain", "-")
        .chain("hostnetd-iabcdefghij", "-")
        .chain("hostnetd-oabcdefghij", "-")
        .rule("FORWARD", "-j hostnetd-FORWARD")
        .rule("hostnetd-FORWARD", "-m physdev --physdev-in tapabcdefghij --physdev-is-bridged -j hostnetd-sg-chain")
        .rule("hostnetd-FORWARD", "-m physdev --physdev-out tapabcdefghij --physdev-is-bridged -j hostnetd-sg-chain")
        .rule("hostnetd-sg-chain", "-m physdev --physdev-in tapabcdefghij --physdev-is-bridged -j hostnetd-oabcdefghij")
        .rule("hostnetd-sg-chain", "-m physdev --physdev-out tapabcdefghij --physdev-is-bridged -j hostnetd-iabcdefghij")
        .build();
    let runner = Arc::new(RecordingRunner::new().with_iptables_dump(dump));
    runner.fail_on("link set qbr-abcdefghij down", 1, "Cannot find device \"qbr-abcdefghij\"");
    runner.fail_on("brctl delbr", 1, "bridge qbr-abcdefghij doesn't exist; can't delete it");
    runner.fail_on("link delete qvb-abcdefghij", 1, "Cannot find device \"qvb-abcdefghij\"");
    let root = tempfile::tempdir().unwrap();
    let orch = orchestrator(runner.clone(), root.path());

    let err = orch
        .detach_port(id_fixtures::PORT_ID, true)
        .await
        .unwrap_err();
    match err {
        HostnetError::Teardown { entity, failures } => {
            assert_eq!(entity, "port abcdefghij0001");
            assert_eq!(failures.len(), 3);
        }
        other => panic!("unexpected error {}", other),
    }

    let after = runner.iptables_dump(None);
    assert!(!after.contains("abcdefghij"));
    assert!(after.contains(":hostnetd-sg-chain - [0:0]"));
    assert!(after.contains("-A FORWARD -j hostnetd-FORWARD"));
    runner
        .verifier()
        .assert_command_executed("/sbin/ipset destroy NIPv4abcdefghij")
        .unwrap();

    // The failed detach keeps the identifier claimed.
    assert_eq!(orch.registry().len(), 1);
}

#[tokio::test]
async fn repeated_dhcp_provision_keeps_running_namespace() {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new().simulate_dnsmasq(4242));
    // Namespace and port left behind by an earlier run whose service died
    runner.respond("netns list", "qdhcp-net0000000 (id: 1)\n");
    runner.respond("port-to-br dhcpnet0000000", "br0\n");
    runner.fail_on("dnsmasq", 2, "dnsmasq: failed to create listening socket");
    let orch = orchestrator(runner.clone(), root.path());

    let req = DhcpProvision {
        network: id_fixtures::NETWORK_ID.to_string(),
        block: "10.0.0.0/24".parse().unwrap(),
        vlan: id_fixtures::VLAN,
        host: None,
        namespace: None,
        first: true,
    };
    orch.provision_dhcp(&req).await.unwrap_err();

    let verifier = runner.verifier();
    verifier.assert_command_not_executed("netns add").unwrap();
    verifier.assert_command_not_executed("add-port").unwrap();
    verifier.assert_command_not_executed("del-port").unwrap();
    verifier.assert_command_not_executed("netns delete").unwrap();
}
