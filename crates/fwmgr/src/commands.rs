//! Command builders for iptables-save / iptables-restore

use hostnet_common::shell::{argv, netns_exec, IPTABLES_RESTORE_CMD, IPTABLES_SAVE_CMD};

/// `iptables-save -c`
pub fn build_iptables_save_cmd(namespace: Option<&str>) -> Vec<String> {
    netns_exec(namespace, argv([IPTABLES_SAVE_CMD, "-c"]))
}

/// `iptables-restore -c`, fed the modified table on stdin
pub fn build_iptables_restore_cmd(namespace: Option<&str>) -> Vec<String> {
    netns_exec(namespace, argv([IPTABLES_RESTORE_CMD, "-c"]))
}
