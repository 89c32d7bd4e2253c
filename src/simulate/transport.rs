//! Emulated guest shells on top of [`SimulatedCloud`]
//!
//! Sessions are only granted where a real lab would grant them: the address
//! must be reachable from where the connection starts, must belong to a
//! server, and the key must be that server's keypair. Commands are matched
//! against the small set the probes, the interface activation and the
//! backend responders issue; anything else exits with 127.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::Ipv4Net;
use regex::Regex;
use tracing::debug;

use super::cloud::{Origin, SimulatedCloud};
use crate::scenario::LocalShellFactory;
use crate::tunnel::{
    CommandChannel, ExecOutput, Hop, Session, Transport, TransportError, TunnelError,
};

/// A command the emulated guest understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestCommand {
    Ping { destination: String },
    InterfaceState { iface: String },
    InterfaceUp { iface: String },
    AddressList,
    RouteTable,
    HttpGet { url: String, timeout_secs: u64 },
    UdpEcho { payload: String, host: String, port: u16, timeout_secs: u64 },
    StartResponder { port: u16, text: String },
    StopResponder { pid: u32, port: u16 },
    TcpProbe { host: String, port: u16 },
    Hostname,
    Noop,
    Unknown,
}

struct Patterns {
    ping: Regex,
    state: Regex,
    up: Regex,
    curl: Regex,
    udp: Regex,
    responder: Regex,
    stop: Regex,
    probe: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        ping: Regex::new(r"^ping -c\s*1 -w\s*1 (\S+)$").unwrap(),
        state: Regex::new(r"^cat /sys/class/net/(\w+)/operstate$").unwrap(),
        up: Regex::new(r"cirros-dhcpc up (\w+)$").unwrap(),
        curl: Regex::new(r"^curl -s -m (\d+) (\S+)$").unwrap(),
        udp: Regex::new(r#"^echo "(.*)" \| nc -u -w (\d+) (\S+) (\d+)$"#).unwrap(),
        responder: Regex::new(r"nc -l -p (\d+) -e echo (\S+);.*echo \$!$").unwrap(),
        stop: Regex::new(r"^kill -9 (\d+); pkill -9 -f 'nc -l -p (\d+)'").unwrap(),
        probe: Regex::new(r"^nc -w (\d+) (\S+) (\d+)$").unwrap(),
    })
}

/// Recognize a shell command. Pure function.
pub fn parse_command(command: &str) -> GuestCommand {
    let command = command.trim();
    let p = patterns();
    if let Some(c) = p.ping.captures(command) {
        return GuestCommand::Ping {
            destination: c[1].to_string(),
        };
    }
    if let Some(c) = p.state.captures(command) {
        return GuestCommand::InterfaceState {
            iface: c[1].to_string(),
        };
    }
    if let Some(c) = p.up.captures(command) {
        return GuestCommand::InterfaceUp {
            iface: c[1].to_string(),
        };
    }
    if command.starts_with("ip -4 addr") || command == "ip addr" {
        return GuestCommand::AddressList;
    }
    if command.ends_with("route -n") {
        return GuestCommand::RouteTable;
    }
    if let Some(c) = p.curl.captures(command) {
        return GuestCommand::HttpGet {
            url: c[2].to_string(),
            timeout_secs: c[1].parse().unwrap_or(1),
        };
    }
    if let Some(c) = p.udp.captures(command) {
        if let Ok(port) = c[4].parse() {
            return GuestCommand::UdpEcho {
                payload: c[1].to_string(),
                host: c[3].to_string(),
                port,
                timeout_secs: c[2].parse().unwrap_or(1),
            };
        }
    }
    if let Some(c) = p.responder.captures(command) {
        if let Ok(port) = c[1].parse() {
            return GuestCommand::StartResponder {
                port,
                text: c[2].to_string(),
            };
        }
    }
    if let Some(c) = p.stop.captures(command) {
        if let (Ok(pid), Ok(port)) = (c[1].parse(), c[2].parse()) {
            return GuestCommand::StopResponder { pid, port };
        }
    }
    if let Some(c) = p.probe.captures(command) {
        if let Ok(port) = c[3].parse() {
            return GuestCommand::TcpProbe {
                host: c[2].to_string(),
                port,
            };
        }
    }
    if command == "hostname" {
        return GuestCommand::Hostname;
    }
    if command == "true" {
        return GuestCommand::Noop;
    }
    GuestCommand::Unknown
}

fn ok(stdout: impl Into<String>) -> ExecOutput {
    ExecOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        status: 0,
    }
}

fn fail(status: i32, stderr: impl Into<String>) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        status,
    }
}

/// A running `nc -l` loop on a guest
#[derive(Debug, Clone)]
struct ResponderProcess {
    pid: u32,
    port: u16,
    text: String,
}

/// State shared by every session of one simulated lab
struct Lab {
    cloud: Arc<SimulatedCloud>,
    http: reqwest::Client,
    executions: Mutex<Vec<(String, String)>>,
    active_interfaces: DashMap<String, HashSet<usize>>,
    responders: DashMap<String, Vec<ResponderProcess>>,
    unreachable: DashMap<String, ()>,
    next_pid: AtomicU32,
}

impl Lab {
    fn record(&self, host: &str, command: &str) {
        if let Ok(mut log) = self.executions.lock() {
            log.push((host.to_string(), command.to_string()));
        }
    }

    fn interface_active(&self, server_id: &str, index: usize) -> bool {
        index == 0
            || self
                .active_interfaces
                .get(server_id)
                .map(|set| set.contains(&index))
                .unwrap_or(false)
    }

    /// Can `origin` reach `destination`, counting the outside world
    fn reaches(&self, origin: Origin<'_>, destination: &str) -> bool {
        if self.cloud.owns_address(destination) {
            return self.cloud.can_reach(origin, destination);
        }
        match origin {
            Origin::External => true,
            Origin::Server(id) => self.cloud.has_external_route(id),
        }
    }

    async fn run(
        &self,
        origin: Origin<'_>,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> ExecOutput {
        self.record(host, command);
        match parse_command(command) {
            GuestCommand::Ping { destination } => {
                if self.reaches(origin, &destination) {
                    ok(format!(
                        "PING {0} ({0}): 56 data bytes\n\
                         1 packets transmitted, 1 packets received, 0% packet loss\n",
                        destination
                    ))
                } else {
                    fail(1, "1 packets transmitted, 0 packets received, 100% packet loss")
                }
            }
            GuestCommand::InterfaceState { iface } => match (origin, iface_index(&iface)) {
                (Origin::Server(id), Some(index)) => {
                    if index >= self.cloud.server_addresses(id).len() {
                        fail(1, format!("cat: can't open '/sys/class/net/{}/operstate'", iface))
                    } else if self.interface_active(id, index) {
                        ok("up\n")
                    } else {
                        ok("down\n")
                    }
                }
                _ => fail(1, "no such interface"),
            },
            GuestCommand::InterfaceUp { iface } => match (origin, iface_index(&iface)) {
                (Origin::Server(id), Some(index))
                    if index < self.cloud.server_addresses(id).len() =>
                {
                    self.active_interfaces
                        .entry(id.to_string())
                        .or_default()
                        .insert(index);
                    ok(format!("udhcpc (v1.20.1) started\nLease of {} obtained\n", iface))
                }
                _ => fail(1, "no such interface"),
            },
            GuestCommand::AddressList => match origin {
                Origin::Server(id) => ok(self.address_list(id)),
                Origin::External => ok("    inet 127.0.0.1/8 scope host lo\n"),
            },
            GuestCommand::RouteTable => match origin {
                Origin::Server(id) => ok(self.route_table(id)),
                Origin::External => fail(1, "route: not available"),
            },
            GuestCommand::HttpGet { url, timeout_secs } => {
                self.http_get(origin, &url, Duration::from_secs(timeout_secs)).await
            }
            GuestCommand::UdpEcho {
                payload,
                host,
                port,
                timeout_secs,
            } => {
                let wait = Duration::from_secs(timeout_secs).min(timeout);
                self.udp_echo(origin, &host, port, &payload, wait).await
            }
            GuestCommand::StartResponder { port, text } => match origin {
                Origin::Server(id) => {
                    let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
                    self.responders
                        .entry(id.to_string())
                        .or_default()
                        .push(ResponderProcess { pid, port, text });
                    ok(format!("{}\n", pid))
                }
                Origin::External => fail(1, "responders run on guests"),
            },
            GuestCommand::StopResponder { pid, port } => {
                if let Origin::Server(id) = origin {
                    if let Some(mut running) = self.responders.get_mut(id) {
                        running.retain(|r| r.pid != pid && r.port != port);
                    }
                }
                ok("")
            }
            GuestCommand::TcpProbe { host, port } => self.tcp_probe(origin, &host, port),
            GuestCommand::Hostname => ok(format!("{}\n", host)),
            GuestCommand::Noop => ok(""),
            GuestCommand::Unknown => fail(127, format!("sh: {}: not found", command)),
        }
    }

    fn address_list(&self, server_id: &str) -> String {
        let mut out = String::from(
            "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue\n    \
             inet 127.0.0.1/8 scope host lo\n",
        );
        for (index, address) in self.cloud.server_addresses(server_id).iter().enumerate() {
            out.push_str(&format!(
                "{}: eth{}: <BROADCAST,MULTICAST,UP,LOWER_UP> \
                 mtu 1500 qdisc pfifo_fast qlen 1000\n",
                index + 2,
                index
            ));
            if !self.interface_active(server_id, index) {
                continue;
            }
            let prefix = self
                .cloud
                .server_subnet_cidr(server_id, index)
                .and_then(|c| Ipv4Net::from_str(&c).ok())
                .map(|n| n.prefix_len())
                .unwrap_or(24);
            out.push_str(&format!(
                "    inet {}/{} scope global eth{}\n",
                address, prefix, index
            ));
        }
        out
    }

    fn route_table(&self, server_id: &str) -> String {
        let mut out = String::from(
            "Kernel IP routing table\n\
             Destination     Gateway         Genmask         Flags Metric Ref    Use Iface\n",
        );
        let count = self.cloud.server_addresses(server_id).len();
        for index in (0..count).filter(|i| self.interface_active(server_id, *i)) {
            let Some(net) = self
                .cloud
                .server_subnet_cidr(server_id, index)
                .and_then(|c| Ipv4Net::from_str(&c).ok())
            else {
                continue;
            };
            if index == 0 {
                if let Some(gateway) = net.hosts().next() {
                    out.push_str(&format!(
                        "{:<15} {:<15} {:<15} UG    0      0        0 eth0\n",
                        "0.0.0.0", gateway, "0.0.0.0"
                    ));
                }
            }
            out.push_str(&format!(
                "{:<15} {:<15} {:<15} U     0      0        0 eth{}\n",
                net.network(),
                "0.0.0.0",
                net.netmask(),
                index
            ));
        }
        out
    }

    async fn http_get(&self, origin: Origin<'_>, url: &str, timeout: Duration) -> ExecOutput {
        if url.starts_with("http://169.254.169.254/") {
            let Origin::Server(id) = origin else {
                return fail(7, "curl: (7) Failed to connect");
            };
            let instance = self
                .cloud
                .servers()
                .into_iter()
                .find(|s| s.id == id)
                .and_then(|s| s.instance_name);
            return match instance.as_deref().and_then(|n| n.rsplit_once('-')) {
                Some((_, suffix)) => ok(format!("i-{}", suffix)),
                None => fail(22, "curl: (22) The requested URL returned error: 404"),
            };
        }

        let host = url
            .trim_start_matches("http://")
            .split(['/', ':'])
            .next()
            .unwrap_or_default()
            .to_string();
        if !self.reaches(origin, &host) {
            return fail(7, "curl: (7) Failed to connect");
        }
        match self.http.get(url).timeout(timeout).send().await {
            Ok(response) => match response.text().await {
                Ok(body) => ok(body),
                Err(e) => fail(56, format!("curl: (56) {}", e)),
            },
            Err(e) if e.is_timeout() => fail(28, "curl: (28) Operation timed out"),
            Err(e) => fail(7, format!("curl: (7) {}", e)),
        }
    }

    async fn udp_echo(
        &self,
        origin: Origin<'_>,
        host: &str,
        port: u16,
        payload: &str,
        timeout: Duration,
    ) -> ExecOutput {
        if !self.reaches(origin, host) {
            return ok("");
        }
        let socket = match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => return fail(1, e.to_string()),
        };
        if let Err(e) = socket.send_to(format!("{}\n", payload).as_bytes(), (host, port)).await {
            return fail(1, e.to_string());
        }
        let mut buf = [0u8; 1024];
        match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => ok(String::from_utf8_lossy(&buf[..n]).to_string()),
            _ => ok(""),
        }
    }

    fn tcp_probe(&self, origin: Origin<'_>, host: &str, port: u16) -> ExecOutput {
        if !self.cloud.can_reach(origin, host) {
            return fail(1, "");
        }
        let server_id = if self.cloud.is_vip(host) {
            self.cloud.pick_backend(origin, host, port)
        } else {
            self.cloud.server_at(origin, host).map(|s| s.id)
        };
        let reply = server_id.and_then(|id| {
            self.responders.get(&id).and_then(|running| {
                running
                    .iter()
                    .find(|r| r.port == port)
                    .map(|r| r.text.clone())
            })
        });
        match reply {
            Some(text) => ok(format!("{}\n", text)),
            None => fail(1, ""),
        }
    }
}

fn iface_index(iface: &str) -> Option<usize> {
    iface.trim_start_matches(|c: char| c.is_ascii_alphabetic()).parse().ok()
}

/// [`Transport`] over a [`SimulatedCloud`]
#[derive(Clone)]
pub struct SimulatedTransport {
    lab: Arc<Lab>,
}

impl SimulatedTransport {
    pub fn new(cloud: Arc<SimulatedCloud>) -> Self {
        Self {
            lab: Arc::new(Lab {
                cloud,
                http: reqwest::Client::new(),
                executions: Mutex::new(Vec::new()),
                active_interfaces: DashMap::new(),
                responders: DashMap::new(),
                unreachable: DashMap::new(),
                next_pid: AtomicU32::new(2000),
            }),
        }
    }

    pub fn cloud(&self) -> &Arc<SimulatedCloud> {
        &self.lab.cloud
    }

    /// Refuse every connection to `address`
    pub fn block(&self, address: &str) {
        self.lab.unreachable.insert(address.to_string(), ());
    }

    /// (host, command) for every command run so far
    pub fn executions(&self) -> Vec<(String, String)> {
        self.lab
            .executions
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Running responders per server name
    pub fn running_responders(&self) -> HashMap<String, usize> {
        let names: HashMap<String, String> = self
            .lab
            .cloud
            .servers()
            .into_iter()
            .map(|s| (s.id, s.name))
            .collect();
        self.lab
            .responders
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| {
                (
                    names.get(e.key()).cloned().unwrap_or_else(|| e.key().clone()),
                    e.value().len(),
                )
            })
            .collect()
    }

    /// The shell of the host running the tests, outside the cloud
    pub fn local_channel(&self) -> SimulatedLocalShell {
        SimulatedLocalShell {
            lab: self.lab.clone(),
        }
    }

    /// Opens a fresh [`SimulatedLocalShell`] on every call
    pub fn local_shells(&self) -> Box<LocalShellFactory> {
        let lab = self.lab.clone();
        Box::new(move || {
            Box::new(SimulatedLocalShell { lab: lab.clone() }) as Box<dyn CommandChannel>
        })
    }
}

pub struct SimulatedSession {
    lab: Arc<Lab>,
    address: String,
    server_id: String,
    server_name: String,
    closed: bool,
}

#[async_trait]
impl Session for SimulatedSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.lab.cloud.servers().iter().all(|s| s.id != self.server_id) {
            return Err(TransportError::Connect(
                self.address.clone(),
                "Connection closed by remote host".to_string(),
            ));
        }
        Ok(self
            .lab
            .run(Origin::Server(&self.server_id), &self.server_name, command, timeout)
            .await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    type Session = SimulatedSession;

    async fn open(
        &self,
        hop: &Hop<'_>,
        via: Option<&SimulatedSession>,
    ) -> Result<SimulatedSession, TransportError> {
        let refuse =
            |reason: &str| TransportError::Connect(hop.address.to_string(), reason.to_string());
        if self.lab.unreachable.contains_key(hop.address) {
            return Err(refuse("Connection timed out"));
        }
        let origin = match via {
            Some(session) => Origin::Server(&session.server_id),
            None => Origin::External,
        };
        if !self.lab.cloud.can_reach(origin, hop.address) {
            return Err(refuse("No route to host"));
        }
        let server = self
            .lab
            .cloud
            .server_at(origin, hop.address)
            .ok_or_else(|| refuse("Connection refused"))?;
        if let Some(index) = self.lab.cloud.interface_index(&server.id, hop.address) {
            if !self.lab.interface_active(&server.id, index) {
                return Err(refuse("No route to host"));
            }
        }
        if self.lab.cloud.private_key_of(&server.id).as_deref() != Some(hop.private_key) {
            return Err(refuse("Permission denied (publickey)"));
        }
        debug!("Simulated session to {} ({})", server.name, hop.address);
        Ok(SimulatedSession {
            lab: self.lab.clone(),
            address: hop.address.to_string(),
            server_id: server.id,
            server_name: server.name,
            closed: false,
        })
    }
}

/// Commands run from outside the cloud
pub struct SimulatedLocalShell {
    lab: Arc<Lab>,
}

#[async_trait]
impl CommandChannel for SimulatedLocalShell {
    fn target(&self) -> &str {
        "localhost"
    }

    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, TunnelError> {
        let output = self.lab.run(Origin::External, "localhost", command, timeout).await;
        if output.status != 0 {
            let combined = format!("{}{}", output.stdout, output.stderr);
            return Err(TunnelError::NonZeroExit {
                status: output.status,
                output: combined.trim_end().to_string(),
            });
        }
        Ok(output.stdout.trim_end().to_string())
    }
}
