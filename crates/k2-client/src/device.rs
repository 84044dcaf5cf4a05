//! Device configuration helpers
//!
//! [`K2Device`] bundles the read-modify-write sequences test setups run
//! against a device: input control, GNSS constellations, NTP servers, clock
//! class, alarms, GNSS receiver status and the gateway reachability check.

use std::net::Ipv4Addr;
use std::sync::Arc;

use k2_core::{Alarm, ApiGeneration, ReferencePriorityList};
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};

use crate::error::{DeviceError, Result};
use crate::poll::{ConvergencePoller, PollOutcome, PollPolicy, Verdict};
use crate::session::{
    parse_alarms, parse_gnss, parse_packet_loss, DeviceSession, GnssStatus, SatelliteView,
    ShellSession,
};

const TIMING_PATH: &str = "/timing";
const NTP_SERVERS_PATH: &str = "/ntp/servers";

/// Configuration access to one device
pub struct K2Device {
    session: Arc<dyn DeviceSession>,
    generation: ApiGeneration,
    shell: Option<Arc<ShellSession>>,
    poller: ConvergencePoller,
    ping_policy: PollPolicy,
}

impl K2Device {
    pub fn new(session: Arc<dyn DeviceSession>, generation: ApiGeneration) -> Self {
        Self {
            session,
            generation,
            shell: None,
            poller: ConvergencePoller::default(),
            ping_policy: PollPolicy::gateway_ping(),
        }
    }

    /// Shell used for alarms and the gateway ping
    pub fn with_shell(mut self, shell: Arc<ShellSession>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_poller(mut self, poller: ConvergencePoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_ping_policy(mut self, policy: PollPolicy) -> Self {
        self.ping_policy = policy;
        self
    }

    fn shell(&self, operation: &str) -> Result<&ShellSession> {
        self.shell
            .as_deref()
            .ok_or_else(|| DeviceError::Unsupported(format!("{} needs a shell session", operation)))
    }

    // =========================================================================
    // Input control
    // =========================================================================

    /// Enable or disable every time and frequency reference input
    ///
    /// Priorities are written back in the generation's write numbering.
    #[instrument(skip(self), fields(api = %self.generation))]
    pub async fn set_all_input_control(&self, enabled: bool) -> Result<()> {
        let mut timing = self.session.get_resource(TIMING_PATH).await?;

        for key in ["timeRefPriority", "freqRefPriority"] {
            let Some(raw) = timing.get(key) else {
                continue;
            };
            let mut list: ReferencePriorityList = serde_json::from_value(raw.clone())
                .map_err(|e| DeviceError::Parse(format!("{}: {}", key, e)))?;
            for entry in list.entries_mut() {
                entry.enabled = enabled;
            }
            timing[key] = json!(self.generation.to_wire(&list));
        }

        self.session
            .put_resource(TIMING_PATH, &json!({ "timing": timing }))
            .await?;
        info!("All reference inputs {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    // =========================================================================
    // GNSS
    // =========================================================================

    /// `PUT /gnss` body enabling only `constellations` (case-insensitive)
    pub async fn gnss_constellation_config(
        &self,
        constellations: &[&str],
        sbas: bool,
    ) -> Result<Value> {
        let gnss = self.session.get_resource("/gnss").await?;
        let wanted: Vec<String> = constellations.iter().map(|c| c.to_uppercase()).collect();
        constellation_body(&gnss, &wanted, sbas)
    }

    #[instrument(skip(self))]
    pub async fn apply_gnss_constellations(&self, constellations: &[&str], sbas: bool) -> Result<()> {
        let body = self.gnss_constellation_config(constellations, sbas).await?;
        self.session.put_resource("/gnss", &body).await?;
        info!("GNSS constellations set to {:?}", constellations);
        Ok(())
    }

    // =========================================================================
    // NTP
    // =========================================================================

    /// Delete every configured NTP server, returning how many were removed
    #[instrument(skip(self))]
    pub async fn delete_all_ntp_servers(&self) -> Result<usize> {
        let count = self.ntp_servers().await?.len();
        // indices shift down after each delete
        for _ in 0..count {
            self.session
                .delete_resource(&format!("{}/1", NTP_SERVERS_PATH))
                .await?;
        }
        info!("Deleted {} NTP servers", count);
        Ok(count)
    }

    #[instrument(skip(self))]
    pub async fn add_ntp_servers(&self, addresses: &[&str]) -> Result<()> {
        let servers: Vec<Value> = addresses
            .iter()
            .map(|address| json!({"role": 0, "addrName": address}))
            .collect();
        self.session
            .post_resource(NTP_SERVERS_PATH, &json!({ "servers": servers }))
            .await?;
        Ok(())
    }

    /// Prefer (or stop preferring) the hardware reference clock in ntpd
    #[instrument(skip(self))]
    pub async fn set_gnss_prefer(&self, prefer: bool) -> Result<()> {
        let body = json!({
            "option": {
                "hwRefClockPrefer": prefer,
                "ntpQueryEnable": false,
                "leapSmearEnable": false,
            }
        });
        self.session.put_resource("/ntp/option", &body).await?;
        Ok(())
    }

    /// Set the prefer flag of the server named `address`
    ///
    /// Returns `false` if no configured server has that address.
    #[instrument(skip(self))]
    pub async fn set_ntp_prefer(&self, address: &str, prefer: bool) -> Result<bool> {
        let servers = self.ntp_servers().await?;
        let Some(index) = servers
            .iter()
            .position(|s| s.get("addrName").and_then(Value::as_str) == Some(address))
        else {
            warn!("NTP server {} is not configured", address);
            return Ok(false);
        };

        let mut server = servers[index].clone();
        server["prefer"] = json!(prefer);
        self.session
            .put_resource(
                &format!("{}/{}", NTP_SERVERS_PATH, index + 1),
                &json!({ "server": server }),
            )
            .await?;
        Ok(true)
    }

    pub async fn restart_ntp(&self) -> Result<()> {
        self.session
            .post_resource(NTP_SERVERS_PATH, &json!({"restart": true}))
            .await?;
        info!("ntpd restarted");
        Ok(())
    }

    async fn ntp_servers(&self) -> Result<Vec<Value>> {
        match self.session.get_resource(NTP_SERVERS_PATH).await? {
            Value::Array(servers) => Ok(servers),
            other => Err(DeviceError::Parse(format!("expected NTP server list, got {}", other))),
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Clock class the PTP grandmaster advertises
    pub async fn clock_class(&self) -> Result<u8> {
        let status = self.session.get_resource("/timingService/status").await?;
        status
            .pointer("/0/status/clockClass")
            .and_then(Value::as_u64)
            .and_then(|class| u8::try_from(class).ok())
            .ok_or_else(|| DeviceError::Parse("timingService status has no clockClass".to_string()))
    }

    /// Active alarms as listed by `show alarm`
    pub async fn alarms(&self) -> Result<Vec<Alarm>> {
        let output = self.shell("alarms")?.run_command("show alarm").await?;
        parse_alarms(&output)
    }

    /// Receiver status and tracked satellites from `show gnss status`
    pub async fn gnss_status(&self) -> Result<(GnssStatus, Vec<SatelliteView>)> {
        let output = self
            .shell("gnss status")?
            .run_command("show gnss status")
            .await?;
        let (satellites, status) = parse_gnss(&output);
        if status == GnssStatus::default() && satellites.is_empty() {
            return Err(DeviceError::Parse(format!(
                "no GNSS status in output: {}",
                output
            )));
        }
        Ok((status, satellites))
    }

    /// Ping the device's `/24` gateway from the device itself
    ///
    /// Every round must report 0% packet loss; the first lossy round ends
    /// the check.
    #[instrument(skip(self))]
    pub async fn gateway_ping(&self) -> Result<PollOutcome<f64>> {
        let shell = self.shell("gateway ping")?;
        let address: Ipv4Addr = shell.host().parse().map_err(|_| {
            DeviceError::Command(format!("{} is not an IPv4 address", shell.host()))
        })?;
        let command = format!("ping {} -c 4", gateway_for(address));

        shell.login_root().await?;

        let rounds = self.ping_policy.max_attempts;
        let mut clean_rounds = 0;
        let outcome = self
            .poller
            .poll_until(
                "clean gateway ping",
                self.ping_policy,
                || {
                    let command = &command;
                    async move {
                        let output = shell.run_command(command).await?;
                        parse_packet_loss(&output).ok_or_else(|| {
                            DeviceError::Parse(format!("no packet loss figure in: {}", output))
                        })
                    }
                },
                |loss: &f64| {
                    if *loss > 0.0 {
                        return Verdict::DefinitelyFailed(format!("{}% packet loss", loss));
                    }
                    clean_rounds += 1;
                    if clean_rounds >= rounds {
                        Verdict::Satisfied
                    } else {
                        Verdict::NotYetSatisfied
                    }
                },
            )
            .await?;

        if !outcome.is_converged() {
            error!(last_state = ?outcome.last_state(), "Gateway ping failed: {}", outcome);
        }
        Ok(outcome)
    }
}

/// Gateway of the `/24` the address sits in
pub fn gateway_for(address: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = address.octets();
    Ipv4Addr::new(a, b, c, 1)
}

fn constellation_body(gnss: &Value, wanted: &[String], sbas: bool) -> Result<Value> {
    let mut satellites = gnss
        .pointer("/constellation/satelliteSystem")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| DeviceError::Parse("gnss has no constellation.satelliteSystem".to_string()))?;

    for satellite in &mut satellites {
        let name = satellite
            .get("satConstellation")
            .and_then(Value::as_str)
            .map(str::to_uppercase)
            .unwrap_or_default();
        let state = if wanted.contains(&name) { "enabled" } else { "disabled" };
        satellite["state"] = json!(state);
    }

    Ok(json!({
        "conf": {
            "constellation": {
                "satelliteSystem": satellites,
                "sbas": if sbas { "enabled" } else { "disabled" },
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ShellOptions;
    use crate::testing::{FakeShell, MockDevice, RecordingSleeper, ScriptedSession, TestServer};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn rest_device(mock: &MockDevice, generation: ApiGeneration) -> (TestServer, K2Device) {
        let server = TestServer::start(mock.router()).await.unwrap();
        let session = Arc::new(server.session(generation).unwrap());
        (server, K2Device::new(session, generation))
    }

    #[test]
    fn test_gateway_is_dot_one() {
        assert_eq!(
            gateway_for(Ipv4Addr::new(10, 241, 54, 221)),
            Ipv4Addr::new(10, 241, 54, 1)
        );
    }

    #[tokio::test]
    async fn test_set_all_input_control_writes_wire_numbering() {
        let mock = MockDevice::new();
        let (_server, device) = rest_device(&mock, ApiGeneration::V2).await;

        device.set_all_input_control(false).await.unwrap();

        let state = mock.state();
        let written = &state.timing_writes[0]["timing"]["timeRefPriority"];
        let list: ReferencePriorityList = serde_json::from_value(written.clone()).unwrap();
        assert_eq!(list.priorities(), vec![1, 2, 3]);
        assert!(list.iter().all(|entry| !entry.enabled));
    }

    #[tokio::test]
    async fn test_gnss_constellations() {
        let mock = MockDevice::new();
        let (_server, device) = rest_device(&mock, ApiGeneration::V2).await;

        device
            .apply_gnss_constellations(&["gps", "Galileo"], false)
            .await
            .unwrap();

        let gnss = mock.state().gnss.clone();
        let states: Vec<_> = gnss["constellation"]["satelliteSystem"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["state"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(states, vec!["enabled", "disabled", "enabled", "disabled"]);
        assert_eq!(gnss["constellation"]["sbas"], "disabled");
    }

    #[tokio::test]
    async fn test_ntp_server_lifecycle() {
        let mock = MockDevice::new();
        let (_server, device) = rest_device(&mock, ApiGeneration::V2).await;

        device.add_ntp_servers(&["10.241.55.21", "10.241.55.22"]).await.unwrap();
        assert_eq!(mock.state().ntp_servers.len(), 2);

        assert!(device.set_ntp_prefer("10.241.55.22", true).await.unwrap());
        assert_eq!(mock.state().ntp_servers[1]["prefer"], true);
        assert!(!device.set_ntp_prefer("10.0.0.9", true).await.unwrap());

        device.set_gnss_prefer(false).await.unwrap();
        assert_eq!(mock.state().ntp_option["option"]["hwRefClockPrefer"], false);

        device.restart_ntp().await.unwrap();
        assert_eq!(mock.state().ntp_restarts, 1);

        assert_eq!(device.delete_all_ntp_servers().await.unwrap(), 2);
        assert!(mock.state().ntp_servers.is_empty());
    }

    #[tokio::test]
    async fn test_clock_class() {
        let mock = MockDevice::new();
        let (_server, device) = rest_device(&mock, ApiGeneration::V2).await;
        assert_eq!(device.clock_class().await.unwrap(), 6);

        mock.state().timing_status = json!([]);
        assert!(matches!(device.clock_class().await, Err(DeviceError::Parse(_))));
    }

    const CLEAN_PING: &str = "\
PING 10.241.54.1 (10.241.54.1) 56(84) bytes of data.
--- 10.241.54.1 ping statistics ---
4 packets transmitted, 4 received, 0% packet loss, time 3004ms";

    const LOSSY_PING: &str = "\
PING 10.241.54.1 (10.241.54.1) 56(84) bytes of data.
--- 10.241.54.1 ping statistics ---
4 packets transmitted, 3 received, 25% packet loss, time 3004ms";

    async fn shell_device(shell: FakeShell) -> (K2Device, Arc<RecordingSleeper>) {
        let (stream, _) = shell.spawn();
        let options = ShellOptions {
            root_password: Some("rootpw".into()),
            timeout: Duration::from_secs(2),
            ..ShellOptions::default()
        };
        let session = ShellSession::from_stream("10.241.54.221", stream, options)
            .await
            .unwrap();
        let sleeper = Arc::new(RecordingSleeper::new());
        let device = K2Device::new(Arc::new(ScriptedSession::new()), ApiGeneration::V2)
            .with_shell(Arc::new(session))
            .with_poller(ConvergencePoller::new(sleeper.clone()));
        (device, sleeper)
    }

    fn root_shell() -> FakeShell {
        FakeShell::new("SyncServer>")
            .on_raw("su", "Password: ")
            .on("rootpw", "")
    }

    #[tokio::test]
    async fn test_gateway_ping_needs_every_round_clean() {
        let (device, sleeper) = shell_device(root_shell().on("ping 10.241.54.1 -c 4", CLEAN_PING)).await;

        let outcome = device.gateway_ping().await.unwrap();
        assert!(outcome.is_converged());
        assert_eq!(outcome.attempts(), 5);
        assert_eq!(sleeper.durations(), vec![Duration::from_secs(5); 4]);
    }

    #[tokio::test]
    async fn test_gateway_ping_fails_on_first_loss() {
        let (device, sleeper) = shell_device(root_shell().on("ping 10.241.54.1 -c 4", LOSSY_PING)).await;

        let outcome = device.gateway_ping().await.unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Diverged { ref reason, attempts: 1, .. } if reason == "25% packet loss"
        ));
        assert_eq!(sleeper.count(), 0);
    }

    #[tokio::test]
    async fn test_alarms_over_shell() {
        let table = "\
|ID |Severity|Time               |Description             |
|---|--------|-------------------|------------------------|
|175|MINOR   |2021-09-09 04:14:35|No power detected on AC2|";
        let (device, _) = shell_device(FakeShell::new("SyncServer>").on("show alarm", table)).await;

        let alarms = device.alarms().await.unwrap();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].event_id, 175);
    }

    #[tokio::test]
    async fn test_gnss_status_over_shell() {
        let output = "\
Latitude                  : 37 24 47.054 N
Used Satellites           : 9
Antenna Status            : OK
|Sat Index|GNSS|SNR|Azimuth|Elevation|PR Res|
|5        |GPS |42 |120    |45       |0.3   |";
        let (device, _) = shell_device(FakeShell::new("SyncServer>").on("show gnss status", output)).await;

        let (status, satellites) = device.gnss_status().await.unwrap();
        assert_eq!(status.used_satellites.as_deref(), Some("9"));
        assert_eq!(status.antenna_status.as_deref(), Some("OK"));
        assert_eq!(satellites.len(), 1);
        assert_eq!(satellites[0].gnss_id, "GPS");
    }

    #[tokio::test]
    async fn test_gnss_status_without_receiver_output() {
        let (device, _) = shell_device(
            FakeShell::new("SyncServer>").on("show gnss status", "GNSS receiver not present"),
        )
        .await;
        assert!(matches!(device.gnss_status().await, Err(DeviceError::Parse(_))));
    }

    #[tokio::test]
    async fn test_shell_operations_without_shell() {
        let device = K2Device::new(Arc::new(ScriptedSession::new()), ApiGeneration::V2);
        assert!(matches!(device.alarms().await, Err(DeviceError::Unsupported(_))));
        assert!(matches!(device.gnss_status().await, Err(DeviceError::Unsupported(_))));
    }
}
