//! IPv4 forwarding and NAT masquerading for the tunnel subnet.
//!
//! Every iptables rule added here records its delete form so that shutdown
//! removes exactly the rules this process installed and nothing else.

use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// Bookkeeping for routing and NAT rules owned by this process
#[derive(Debug, Default)]
pub struct RoutingState {
    nat_rules: Vec<Vec<String>>,
}

impl RoutingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the `iptables` delete-arguments for a rule we added
    fn add_rule(&mut self, delete_args: Vec<String>) {
        self.nat_rules.push(delete_args);
    }

    pub fn rules(&self) -> &[Vec<String>] {
        &self.nat_rules
    }

    fn clear(&mut self) {
        self.nat_rules.clear();
    }
}

/// Enable IPv4 forwarding
pub fn enable_ip_forwarding() -> Result<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1").context("enabling IP forwarding")?;
    info!("IP forwarding enabled");
    Ok(())
}

/// Check whether an iptables rule exists (suppresses "Bad rule" stderr)
fn iptables_rule_exists(args: &[&str]) -> bool {
    Command::new("iptables")
        .args(args)
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

fn install_rule(add_args: &[&str], state: &mut RoutingState) -> Result<()> {
    let mut check_args: Vec<&str> = add_args.to_vec();
    let Some(flag) = check_args.iter().position(|a| *a == "-A") else {
        warn!(args = ?add_args, "rule has no append flag, skipping");
        return Ok(());
    };
    check_args[flag] = "-C";

    if iptables_rule_exists(&check_args) {
        return Ok(());
    }

    let status = Command::new("iptables")
        .args(add_args)
        .status()
        .context("running iptables")?;

    if status.success() {
        let mut delete_args: Vec<String> = add_args.iter().map(|s| s.to_string()).collect();
        delete_args[flag] = "-D".to_string();
        state.add_rule(delete_args);
    } else {
        warn!(args = ?add_args, "iptables rule installation may have failed");
    }
    Ok(())
}

/// Install masquerading and forward rules between the TUN device and the
/// outbound interface
pub fn setup_nat(tun_name: &str, outbound_iface: &str, state: &mut RoutingState) -> Result<()> {
    install_rule(
        &[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-o",
            outbound_iface,
            "-j",
            "MASQUERADE",
        ],
        state,
    )?;

    install_rule(
        &[
            "-A",
            "FORWARD",
            "-i",
            tun_name,
            "-o",
            outbound_iface,
            "-j",
            "ACCEPT",
        ],
        state,
    )?;

    install_rule(
        &[
            "-A",
            "FORWARD",
            "-i",
            outbound_iface,
            "-o",
            tun_name,
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ],
        state,
    )?;

    info!(tun = %tun_name, outbound = %outbound_iface, "NAT masquerading configured");
    Ok(())
}

/// Remove every NAT rule recorded in `state`
pub fn teardown_nat(state: &mut RoutingState) -> Result<()> {
    let mut failures = 0usize;

    for delete_args in state.rules() {
        let status = Command::new("iptables").args(delete_args).status();
        if !status.is_ok_and(|s| s.success()) {
            failures += 1;
        }
    }

    state.clear();

    if failures > 0 {
        warn!(failures, "some NAT rules failed to remove");
    } else {
        info!("NAT teardown complete");
    }

    Ok(())
}
