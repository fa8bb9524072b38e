mod nic;

use clap::Parser;
use nic::Nic;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use usernet_stack::{NetConfig, Redirect};

#[derive(Parser)]
#[command(name = "usernet")]
#[command(about = "User-mode NAT network for a virtual machine's NIC")]
struct Cli {
    /// Unix datagram socket the emulator's NIC connects to
    #[arg(long, default_value = "/tmp/usernet.sock")]
    socket: PathBuf,

    /// JSON network configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Forward a host port to the guest, as tcp:HOST_PORT:GUEST_PORT or
    /// udp:HOST_PORT:GUEST_PORT
    #[arg(long = "redirect", value_parser = parse_redirect)]
    redirects: Vec<Redirect>,

    /// Directory served over TFTP at the gateway address
    #[arg(long)]
    tftp_root: Option<PathBuf>,

    /// Upstream DNS server; defaults to the host's resolv.conf
    #[arg(long)]
    dns: Option<Ipv4Addr>,
}

fn parse_redirect(s: &str) -> Result<Redirect, String> {
    let mut parts = s.splitn(3, ':');
    let (Some(proto), Some(host), Some(guest)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected PROTO:HOST_PORT:GUEST_PORT, got {:?}", s));
    };
    let udp = match proto {
        "tcp" => false,
        "udp" => true,
        other => return Err(format!("unknown protocol {:?}", other)),
    };
    let port = |p: &str| p.parse::<u16>().map_err(|e| format!("bad port {:?}: {}", p, e));
    Ok(Redirect {
        udp,
        host_port: port(host)?,
        guest_port: port(guest)?,
        guest_addr: None,
    })
}

impl Cli {
    fn net_config(&self) -> Result<NetConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => NetConfig::from_json_file(path)?,
            None => NetConfig::default(),
        };
        config.redirects.extend(self.redirects.iter().cloned());
        if let Some(root) = &self.tftp_root {
            config.tftp_root = root.clone();
        }
        if self.dns.is_some() {
            config.dns_server = self.dns;
        }
        config.resolve_dns_server();
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.net_config()?;
    let nic = Nic::bind(&cli.socket)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let mut worker = tokio::task::spawn_blocking(move || {
        if !nic.wait_for_peer(&flag)? {
            return Ok(());
        }
        nic.run(config, &flag)
    });

    tokio::select! {
        result = &mut worker => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            shutdown.store(true, Ordering::Relaxed);
            worker.await??;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_redirect() {
        let r = parse_redirect("tcp:2222:22").unwrap();
        assert!(!r.udp);
        assert_eq!((r.host_port, r.guest_port), (2222, 22));
        assert!(parse_redirect("udp:5353:53").unwrap().udp);
        assert!(parse_redirect("sctp:1:2").is_err());
        assert!(parse_redirect("tcp:2222").is_err());
        assert!(parse_redirect("tcp:x:22").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "usernet",
            "--redirect",
            "tcp:8080:80",
            "--tftp-root",
            "/srv/tftp",
            "--dns",
            "1.1.1.1",
        ]);
        let config = cli.net_config().unwrap();
        assert_eq!(config.redirects.len(), 1);
        assert_eq!(config.tftp_root, PathBuf::from("/srv/tftp"));
        assert_eq!(config.dns_server, Some(Ipv4Addr::new(1, 1, 1, 1)));
    }
}
