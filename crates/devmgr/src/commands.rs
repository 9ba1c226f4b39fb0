//! Command builders for device primitives
//!
//! Every builder returns an argv vector. Builders taking a namespace wrap the
//! command in `ip netns exec <ns>` when one is given.

use hostnet_common::shell::{
    argv, netns_exec, BRCTL_CMD, IPSET_CMD, IP_CMD, OVS_OFCTL_CMD, OVS_VSCTL_CMD,
};
use std::time::Duration;

/// Set type used for per-port address sets
pub const IPSET_TYPE: &str = "hash:net";

fn ip(namespace: Option<&str>, args: &[&str]) -> Vec<String> {
    let mut cmd = argv([IP_CMD]);
    cmd.extend(args.iter().map(|a| a.to_string()));
    netns_exec(namespace, cmd)
}

// ---- ip netns ----

/// `ip netns add <ns>`
pub fn build_netns_add_cmd(ns: &str) -> Vec<String> {
    ip(None, &["netns", "add", ns])
}

/// `ip netns delete <ns>`
pub fn build_netns_delete_cmd(ns: &str) -> Vec<String> {
    ip(None, &["netns", "delete", ns])
}

/// `ip netns list`
pub fn build_netns_list_cmd() -> Vec<String> {
    ip(None, &["netns", "list"])
}

// ---- ip link ----

/// `ip link set <dev> up|down`
pub fn build_link_set_state_cmd(dev: &str, up: bool, namespace: Option<&str>) -> Vec<String> {
    let state = if up { "up" } else { "down" };
    ip(namespace, &["link", "set", dev, state])
}

/// `ip link set <dev> netns <ns>`
pub fn build_link_set_netns_cmd(dev: &str, ns: &str) -> Vec<String> {
    ip(None, &["link", "set", dev, "netns", ns])
}

/// `ip link delete <dev>`
pub fn build_link_delete_cmd(dev: &str, namespace: Option<&str>) -> Vec<String> {
    ip(namespace, &["link", "delete", dev])
}

/// `ip link show <dev>`, exit status tells whether the device exists
pub fn build_link_show_cmd(dev: &str, namespace: Option<&str>) -> Vec<String> {
    ip(namespace, &["link", "show", dev])
}

/// `ip link add <a> type veth peer name <b> [netns <ns>]`
pub fn build_veth_add_cmd(name: &str, peer: &str, peer_namespace: Option<&str>) -> Vec<String> {
    let mut cmd = ip(None, &["link", "add", name, "type", "veth", "peer", "name", peer]);
    if let Some(ns) = peer_namespace {
        cmd.extend(argv(["netns", ns]));
    }
    cmd
}

// ---- ip addr ----

/// `ip addr add <cidr> dev <dev>`
pub fn build_addr_add_cmd(cidr: &str, dev: &str, namespace: Option<&str>) -> Vec<String> {
    ip(namespace, &["addr", "add", cidr, "dev", dev])
}

/// `ip -o -4 addr show dev <dev>`
pub fn build_addr_show_cmd(dev: &str, namespace: Option<&str>) -> Vec<String> {
    ip(namespace, &["-o", "-4", "addr", "show", "dev", dev])
}

// ---- ip route ----

/// `ip route replace <cidr> dev <dev> scope link`
pub fn build_route_replace_onlink_cmd(cidr: &str, dev: &str, namespace: Option<&str>) -> Vec<String> {
    ip(namespace, &["route", "replace", cidr, "dev", dev, "scope", "link"])
}

/// `ip route del <cidr> dev <dev> scope link`
pub fn build_route_del_onlink_cmd(cidr: &str, dev: &str, namespace: Option<&str>) -> Vec<String> {
    ip(namespace, &["route", "del", cidr, "dev", dev, "scope", "link"])
}

/// `ip route list dev <dev> scope link`
pub fn build_route_list_onlink_cmd(dev: &str, namespace: Option<&str>) -> Vec<String> {
    ip(namespace, &["route", "list", "dev", dev, "scope", "link"])
}

// ---- brctl ----

/// `brctl addbr <br>`
pub fn build_brctl_addbr_cmd(bridge: &str) -> Vec<String> {
    argv([BRCTL_CMD, "addbr", bridge])
}

/// `brctl delbr <br>`
pub fn build_brctl_delbr_cmd(bridge: &str) -> Vec<String> {
    argv([BRCTL_CMD, "delbr", bridge])
}

/// `brctl addif <br> <port>`
pub fn build_brctl_addif_cmd(bridge: &str, port: &str) -> Vec<String> {
    argv([BRCTL_CMD, "addif", bridge, port])
}

// ---- ovs-vsctl ----

/// `ovs-vsctl --timeout=<t> <args...>`
pub fn build_vsctl_cmd(timeout: Duration, args: &[&str]) -> Vec<String> {
    let mut cmd = argv([OVS_VSCTL_CMD.to_string(), format!("--timeout={}", timeout.as_secs())]);
    cmd.extend(args.iter().map(|a| a.to_string()));
    cmd
}

/// `-- --may-exist add-port <br> <port> [tag=<vlan>]`
pub fn build_add_port_cmd(timeout: Duration, bridge: &str, port: &str, vlan: Option<u16>) -> Vec<String> {
    let mut cmd = build_vsctl_cmd(timeout, &["--", "--may-exist", "add-port", bridge, port]);
    if let Some(tag) = vlan {
        cmd.push(format!("tag={}", tag));
    }
    cmd
}

/// `add-port <br> <port> [tag=<vlan>] -- set interface <port> type=internal`
pub fn build_add_internal_port_cmd(
    timeout: Duration,
    bridge: &str,
    port: &str,
    vlan: Option<u16>,
) -> Vec<String> {
    let mut cmd = build_vsctl_cmd(timeout, &["--", "--may-exist", "add-port", bridge, port]);
    if let Some(tag) = vlan {
        cmd.push(format!("tag={}", tag));
    }
    cmd.extend(argv(["--", "set", "interface", port, "type=internal"]));
    cmd
}

/// `-- --if-exists del-port <br> <port>`
pub fn build_del_port_cmd(timeout: Duration, bridge: &str, port: &str) -> Vec<String> {
    build_vsctl_cmd(timeout, &["--", "--if-exists", "del-port", bridge, port])
}

/// `set port <port> tag=<vlan>`
pub fn build_set_port_tag_cmd(timeout: Duration, port: &str, vlan: u16) -> Vec<String> {
    let tag = format!("tag={}", vlan);
    build_vsctl_cmd(timeout, &["set", "port", port, tag.as_str()])
}

/// `port-to-br <port>`
pub fn build_port_to_bridge_cmd(timeout: Duration, port: &str) -> Vec<String> {
    build_vsctl_cmd(timeout, &["port-to-br", port])
}

/// `get <table> <record> <column>`
pub fn build_db_get_cmd(timeout: Duration, table: &str, record: &str, column: &str) -> Vec<String> {
    build_vsctl_cmd(timeout, &["get", table, record, column])
}

/// Creates a mirror selecting all traffic and attaches it to the bridge in
/// one transaction.
pub fn build_create_mirror_cmd(timeout: Duration, bridge: &str, name: &str, vlan: u16) -> Vec<String> {
    let name_arg = format!("name={}", name);
    let vlan_arg = format!("output_vlan={}", vlan);
    build_vsctl_cmd(
        timeout,
        &[
            "--", "--id=@m", "create", "mirror", name_arg.as_str(), "select_all=true", vlan_arg.as_str(),
            "--", "add", "bridge", bridge, "mirrors", "@m",
        ],
    )
}

/// `clear bridge <br> mirrors`
pub fn build_clear_mirrors_cmd(timeout: Duration, bridge: &str) -> Vec<String> {
    build_vsctl_cmd(timeout, &["clear", "bridge", bridge, "mirrors"])
}

/// `get bridge <br> mirrors`
pub fn build_get_mirrors_cmd(timeout: Duration, bridge: &str) -> Vec<String> {
    build_db_get_cmd(timeout, "bridge", bridge, "mirrors")
}

// ---- ovs-ofctl ----

/// `ovs-ofctl [--strict] <action> <br> [flow]`
pub fn build_ofctl_cmd(action: &str, strict: bool, bridge: &str, flow: Option<&str>) -> Vec<String> {
    let mut cmd = argv([OVS_OFCTL_CMD]);
    if strict {
        cmd.push("--strict".to_string());
    }
    cmd.extend(argv([action, bridge]));
    if let Some(f) = flow {
        cmd.push(f.to_string());
    }
    cmd
}

// ---- ipset ----

fn ipset(namespace: Option<&str>, args: &[&str]) -> Vec<String> {
    let mut cmd = argv([IPSET_CMD]);
    cmd.extend(args.iter().map(|a| a.to_string()));
    netns_exec(namespace, cmd)
}

/// `ipset create -exist <name> hash:net`
pub fn build_ipset_create_cmd(name: &str, namespace: Option<&str>) -> Vec<String> {
    ipset(namespace, &["create", "-exist", name, IPSET_TYPE])
}

/// `ipset destroy <name>`
pub fn build_ipset_destroy_cmd(name: &str, namespace: Option<&str>) -> Vec<String> {
    ipset(namespace, &["destroy", name])
}

/// `ipset add -exist <name> <member>`
pub fn build_ipset_add_cmd(name: &str, member: &str, namespace: Option<&str>) -> Vec<String> {
    ipset(namespace, &["add", "-exist", name, member])
}

/// `ipset del <name> <member>`
pub fn build_ipset_del_cmd(name: &str, member: &str, namespace: Option<&str>) -> Vec<String> {
    ipset(namespace, &["del", name, member])
}

/// `ipset flush <name>`
pub fn build_ipset_flush_cmd(name: &str, namespace: Option<&str>) -> Vec<String> {
    ipset(namespace, &["flush", name])
}
