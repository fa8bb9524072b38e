//! Stack configuration.
//!
//! Loaded once at startup, either from a JSON document or assembled by the
//! embedding emulator. Port redirects may also come from the emulator's flat
//! option table as indexed `{n}_udp`, `{n}_from` and `{n}_to` entries.

use crate::StackError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// A static port redirect: connections to `host_port` on the host are
/// forwarded to `guest_port` on the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    #[serde(default)]
    pub udp: bool,
    pub host_port: u16,
    pub guest_port: u16,
    /// Defaults to the configured guest address.
    #[serde(default)]
    pub guest_addr: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Virtual network the guest lives in.
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Address handed to the guest over DHCP.
    pub guest_addr: Ipv4Addr,
    /// Gateway alias; connections to it reach the host's loopback.
    pub alias_addr: Ipv4Addr,
    /// DNS alias; traffic to it reaches `dns_server`.
    pub dns_alias: Ipv4Addr,
    /// Host address advertised by protocol emulation. Falls back to the
    /// gateway alias.
    pub host_addr: Option<Ipv4Addr>,
    /// Real resolver. Read from `/etc/resolv.conf` when unset.
    pub dns_server: Option<Ipv4Addr>,
    /// Directory served by the TFTP server.
    pub tftp_root: PathBuf,
    pub mtu: usize,
    pub mbuf_high_water: usize,
    pub mbuf_limit: usize,
    pub max_sockets: usize,
    pub max_reassembly_queues: usize,
    pub redirects: Vec<Redirect>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(10, 0, 2, 0),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            guest_addr: Ipv4Addr::new(10, 0, 2, 15),
            alias_addr: Ipv4Addr::new(10, 0, 2, 2),
            dns_alias: Ipv4Addr::new(10, 0, 2, 3),
            host_addr: None,
            dns_server: None,
            tftp_root: PathBuf::from("tftp"),
            mtu: 1500,
            mbuf_high_water: 256,
            mbuf_limit: 4096,
            max_sockets: 1024,
            max_reassembly_queues: 64,
            redirects: Vec::new(),
        }
    }
}

impl NetConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StackError> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: NetConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StackError> {
        for (name, addr) in [
            ("guest_addr", self.guest_addr),
            ("alias_addr", self.alias_addr),
            ("dns_alias", self.dns_alias),
        ] {
            if !self.is_virtual(addr) {
                return Err(StackError::InvalidConfig(format!(
                    "{} {} is outside {}/{}",
                    name, addr, self.network, self.netmask
                )));
            }
        }
        if self.guest_addr == self.alias_addr || self.guest_addr == self.dns_alias {
            return Err(StackError::InvalidConfig(
                "guest address collides with an alias".to_string(),
            ));
        }
        if !(576..=9000).contains(&self.mtu) {
            return Err(StackError::InvalidConfig(format!(
                "mtu {} out of range",
                self.mtu
            )));
        }
        Ok(())
    }

    /// Whether `addr` lies inside the virtual network.
    pub fn is_virtual(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.netmask) == u32::from(self.network)
    }

    /// Addresses the stack services itself.
    pub fn is_alias(&self, addr: Ipv4Addr) -> bool {
        addr == self.alias_addr || addr == self.dns_alias
    }

    /// Real endpoint behind a destination the guest addressed. Virtual
    /// addresses other than the DNS alias map onto the host's loopback.
    pub fn host_target(&self, addr: Ipv4Addr) -> Ipv4Addr {
        if !self.is_virtual(addr) {
            return addr;
        }
        if addr == self.dns_alias {
            self.resolver()
        } else {
            Ipv4Addr::LOCALHOST
        }
    }

    pub fn resolver(&self) -> Ipv4Addr {
        self.dns_server.unwrap_or(Ipv4Addr::LOCALHOST)
    }

    /// Address outside peers should use to reach redirected guest ports.
    pub fn nat_visible_addr(&self) -> Ipv4Addr {
        self.host_addr.unwrap_or(self.alias_addr)
    }

    pub fn broadcast_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !u32::from(self.netmask))
    }

    /// Fill in the resolver from the host's resolver configuration.
    pub fn resolve_dns_server(&mut self) {
        if self.dns_server.is_some() {
            return;
        }
        match std::fs::read_to_string("/etc/resolv.conf") {
            Ok(contents) => {
                self.dns_server = parse_resolv_conf(&contents);
                if let Some(addr) = self.dns_server {
                    tracing::debug!(%addr, "using host resolver");
                }
            }
            Err(e) => tracing::debug!(error = %e, "no resolv.conf, DNS alias maps to loopback"),
        }
    }

    /// Parse indexed `{n}_udp`, `{n}_from`, `{n}_to` option entries into the
    /// redirect table and append them to `redirects`.
    pub fn parse_redirects<I, K, V>(&mut self, entries: I) -> Result<(), StackError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.redirects.extend(parse_redirect_entries(entries)?);
        Ok(())
    }
}

#[derive(Default)]
struct PartialRedirect {
    udp: Option<bool>,
    from: Option<u16>,
    to: Option<u16>,
}

fn parse_redirect_entries<I, K, V>(entries: I) -> Result<Vec<Redirect>, StackError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut table: BTreeMap<u32, PartialRedirect> = BTreeMap::new();
    for (key, value) in entries {
        let key = key.as_ref();
        let value = value.as_ref().trim();
        let Some((index, field)) = key.split_once('_') else {
            continue;
        };
        let Ok(index) = index.parse::<u32>() else {
            continue;
        };
        let entry = table.entry(index).or_default();
        match field {
            "udp" => entry.udp = Some(parse_bool(key, value)?),
            "from" => entry.from = Some(parse_port(key, value)?),
            "to" => entry.to = Some(parse_port(key, value)?),
            _ => {}
        }
    }

    table
        .into_iter()
        .map(|(index, p)| match (p.from, p.to) {
            (Some(host_port), Some(guest_port)) => Ok(Redirect {
                udp: p.udp.unwrap_or(false),
                host_port,
                guest_port,
                guest_addr: None,
            }),
            _ => Err(StackError::InvalidConfig(format!(
                "redirect {} needs both {}_from and {}_to",
                index, index, index
            ))),
        })
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, StackError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StackError::InvalidConfig(format!(
            "{}: expected a boolean, got {:?}",
            key, value
        ))),
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, StackError> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(StackError::InvalidConfig(format!(
            "{}: invalid port {:?}",
            key, value
        ))),
    }
}

/// First IPv4 `nameserver` line of a resolv.conf document.
pub fn parse_resolv_conf(contents: &str) -> Option<Ipv4Addr> {
    contents.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        if words.next()? != "nameserver" {
            return None;
        }
        words.next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = NetConfig::default();
        config.validate().unwrap();
        assert!(config.is_virtual(config.guest_addr));
        assert_eq!(config.broadcast_addr(), Ipv4Addr::new(10, 0, 2, 255));
    }

    #[test]
    fn test_host_target() {
        let mut config = NetConfig::default();
        config.dns_server = Some(Ipv4Addr::new(192, 0, 2, 53));
        assert_eq!(
            config.host_target(config.dns_alias),
            Ipv4Addr::new(192, 0, 2, 53)
        );
        assert_eq!(config.host_target(config.alias_addr), Ipv4Addr::LOCALHOST);
        let outside = Ipv4Addr::new(198, 51, 100, 7);
        assert_eq!(config.host_target(outside), outside);
    }

    #[test]
    fn test_parse_redirects() {
        let mut config = NetConfig::default();
        config
            .parse_redirects([
                ("1_from", "8080"),
                ("0_udp", "true"),
                ("0_from", "5353"),
                ("0_to", "53"),
                ("1_to", "80"),
                ("unrelated", "x"),
            ])
            .unwrap();
        assert_eq!(
            config.redirects,
            vec![
                Redirect {
                    udp: true,
                    host_port: 5353,
                    guest_port: 53,
                    guest_addr: None
                },
                Redirect {
                    udp: false,
                    host_port: 8080,
                    guest_port: 80,
                    guest_addr: None
                },
            ]
        );
    }

    #[test]
    fn test_parse_redirects_incomplete() {
        let mut config = NetConfig::default();
        let err = config.parse_redirects([("3_from", "22")]).unwrap_err();
        assert!(matches!(err, StackError::InvalidConfig(_)));
        let err = config.parse_redirects([("3_from", "0"), ("3_to", "1")]);
        assert!(err.is_err());
    }

    #[test]
    fn test_parse_resolv_conf() {
        let contents = "# comment\nsearch example.com\nnameserver fe80::1\nnameserver 192.0.2.1\n";
        assert_eq!(
            parse_resolv_conf(contents),
            Some(Ipv4Addr::new(192, 0, 2, 1))
        );
        assert_eq!(parse_resolv_conf("search x\n"), None);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tftp_root": "/srv/tftp", "redirects": [{{"host_port": 2222, "guest_port": 22}}]}}"#
        )
        .unwrap();
        let config = NetConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.tftp_root, PathBuf::from("/srv/tftp"));
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.redirects[0].host_port, 2222);
        assert!(!config.redirects[0].udp);
    }

    #[test]
    fn test_validate_rejects_guest_outside_network() {
        let config = NetConfig {
            guest_addr: Ipv4Addr::new(192, 168, 1, 2),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
