//! Socket client for the microscope automation server.
//!
//! Requests and replies are newline-delimited JSON objects:
//!
//! ```text
//! -> {"id":7,"cmd":"SetSpotSize","args":[5]}
//! <- {"id":7,"ok":true,"values":[]}
//! -> {"id":8,"cmd":"ReportIlluminatedArea","args":[]}
//! <- {"id":8,"ok":false,"error":"Not available on this microscope"}
//! ```
//!
//! One request is in flight at a time. A reply that arrives after the call
//! timeout closes the connection, since the stream can no longer be trusted
//! to be in step.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{
    ApertureKind, EucentricityMode, FocusMode, Microscope, Preset, ProbeMode, Processing,
    ReadoutMode, SensorArea,
};
use crate::config::ConnectionSettings;
use crate::error::{AppResult, EmError};

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    cmd: &'a str,
    args: &'a [Value],
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    values: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

/// Client for one automation-server session.
pub struct SemClient {
    address: String,
    call_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl SemClient {
    /// Open the control channel.
    ///
    /// Failure here is an environment problem and is not retried.
    pub async fn connect(settings: &ConnectionSettings) -> AppResult<Self> {
        let address = settings.address();
        let stream = timeout(settings.timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| EmError::Connection {
                address: address.clone(),
                reason: format!("no answer within {:?}", settings.timeout),
            })?
            .map_err(|e| EmError::Connection {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        debug!("Connected to automation server at {}", address);

        Ok(Self {
            address,
            call_timeout: settings.timeout,
            connection: Mutex::new(Some(Connection {
                reader: BufReader::new(read_half),
                writer: write_half,
                next_id: 1,
            })),
        })
    }

    /// Server address this client talks to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one command and wait for its reply values.
    async fn call(&self, cmd: &str, args: &[Value]) -> Result<Vec<Value>> {
        let mut guard = self.connection.lock().await;
        let connection = guard
            .as_mut()
            .ok_or_else(|| anyhow!("Not connected to {}", self.address))?;

        let id = connection.next_id;
        connection.next_id += 1;

        let mut line = serde_json::to_string(&Request { id, cmd, args })?;
        line.push('\n');
        debug!("-> {}", line.trim_end());

        let exchange = async {
            connection.writer.write_all(line.as_bytes()).await?;
            connection.writer.flush().await?;

            let mut reply = String::new();
            let n = connection.reader.read_line(&mut reply).await?;
            if n == 0 {
                bail!("Automation server closed the connection");
            }
            Ok::<_, anyhow::Error>(reply)
        };

        let outcome = timeout(self.call_timeout, exchange).await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                *guard = None;
                return Err(e.context(format!("{} failed", cmd)));
            }
            Err(_) => {
                warn!("{} timed out after {:?}; dropping connection", cmd, self.call_timeout);
                *guard = None;
                bail!("{} timed out after {:?}", cmd, self.call_timeout);
            }
        };
        debug!("<- {}", reply.trim_end());

        let reply: Reply = serde_json::from_str(&reply)
            .with_context(|| format!("Malformed reply to {}: {}", cmd, reply.trim_end()))?;
        if reply.id != id {
            *guard = None;
            bail!("Reply id {} does not match request id {} ({})", reply.id, id, cmd);
        }
        if !reply.ok {
            bail!(
                "{}: {}",
                cmd,
                reply.error.unwrap_or_else(|| "command failed".to_string())
            );
        }
        Ok(reply.values)
    }

    async fn command(&self, cmd: &str, args: &[Value]) -> Result<()> {
        self.call(cmd, args).await.map(|_| ())
    }

    async fn query_values(&self, cmd: &str, args: &[Value], count: usize) -> Result<Vec<f64>> {
        let values = self.call(cmd, args).await?;
        if values.len() < count {
            bail!("{} returned {} values, expected {}", cmd, values.len(), count);
        }
        values
            .iter()
            .take(count)
            .map(|v| {
                as_f64(v).ok_or_else(|| anyhow!("{} returned non-numeric value {}", cmd, v))
            })
            .collect()
    }

    async fn query_f64(&self, cmd: &str, args: &[Value]) -> Result<f64> {
        Ok(self.query_values(cmd, args, 1).await?[0])
    }

    async fn query_u32(&self, cmd: &str, args: &[Value]) -> Result<u32> {
        let value = self.query_f64(cmd, args).await?;
        if value < 0.0 || value > f64::from(u32::MAX) {
            bail!("{} returned out-of-range value {}", cmd, value);
        }
        Ok(value.round() as u32)
    }

    async fn query_bool(&self, cmd: &str, args: &[Value]) -> Result<bool> {
        Ok(self.query_f64(cmd, args).await? != 0.0)
    }

    async fn query_pair(&self, cmd: &str, args: &[Value]) -> Result<(f64, f64)> {
        let v = self.query_values(cmd, args, 2).await?;
        Ok((v[0], v[1]))
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl Microscope for SemClient {
    async fn suppress_error_dialogs(&self, suppress: bool) -> Result<()> {
        if suppress {
            self.command("SuppressReports", &[]).await?;
            self.command("ErrorsToLog", &[]).await
        } else {
            self.command("ErrorBoxes", &[]).await
        }
    }

    async fn set_user_setting(&self, name: &str, value: f64) -> Result<()> {
        self.command("SetUserSetting", &[json!(name), json!(value), json!(1)])
            .await
    }

    async fn pause(&self, message: &str) -> Result<()> {
        self.command("Pause", &[json!(message)]).await
    }

    async fn exit(&self) -> Result<()> {
        let result = self.command("Exit", &[]).await;
        *self.connection.lock().await = None;
        result
    }

    async fn camera_names(&self) -> Result<Vec<String>> {
        let values = self.call("ListCameras", &[]).await?;
        values
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(anyhow!("ListCameras returned non-string {}", other)),
            })
            .collect()
    }

    async fn select_camera(&self, number: usize) -> Result<()> {
        self.command("SelectCamera", &[json!(number)]).await
    }

    async fn field_of_view(&self) -> Result<f64> {
        self.query_f64("ReportFieldOfView", &[]).await
    }

    async fn column_valves_open(&self) -> Result<bool> {
        self.query_bool("ReportColumnOrGunValve", &[]).await
    }

    async fn set_column_valves(&self, open: bool) -> Result<()> {
        self.command("SetColumnOrGunValve", &[json!(i64::from(open))])
            .await
    }

    async fn dewars_filling(&self) -> Result<bool> {
        self.query_bool("AreDewarsFilling", &[]).await
    }

    async fn dewars_remaining_time(&self) -> Result<f64> {
        self.query_f64("DewarsRemainingTime", &[]).await
    }

    async fn pump_running(&self) -> Result<bool> {
        self.query_bool("IsPVPRunning", &[]).await
    }

    async fn set_low_dose(&self, enabled: bool) -> Result<()> {
        self.command("SetLowDoseMode", &[json!(i64::from(enabled))])
            .await
    }

    async fn exposure(&self, preset: Preset) -> Result<f64> {
        self.query_f64("ReportExposure", &[json!(preset.code())])
            .await
    }

    async fn set_exposure(&self, preset: Preset, seconds: f64) -> Result<()> {
        self.command("SetExposure", &[json!(preset.code()), json!(seconds)])
            .await
    }

    async fn binning(&self, preset: Preset) -> Result<u32> {
        self.query_u32("ReportBinning", &[json!(preset.code())])
            .await
    }

    async fn set_binning(&self, preset: Preset, binning: u32) -> Result<()> {
        self.command("SetBinning", &[json!(preset.code()), json!(binning)])
            .await
    }

    async fn set_camera_area(&self, preset: Preset, area: SensorArea) -> Result<()> {
        self.command("SetCameraArea", &[json!(preset.code()), json!(area.code())])
            .await
    }

    async fn set_processing(&self, preset: Preset, processing: Processing) -> Result<()> {
        self.command(
            "SetProcessing",
            &[json!(preset.code()), json!(processing.code())],
        )
        .await
    }

    async fn set_readout_mode(&self, preset: Preset, mode: ReadoutMode) -> Result<()> {
        self.command("SetK2ReadMode", &[json!(preset.code()), json!(mode.code())])
            .await
    }

    async fn set_frame_time(&self, preset: Preset, seconds: f64) -> Result<()> {
        self.command("SetFrameTime", &[json!(preset.code()), json!(seconds)])
            .await
    }

    async fn set_frame_alignment(&self, enabled: bool) -> Result<()> {
        self.command("SetFrameAlign", &[json!(i64::from(enabled))])
            .await
    }

    async fn set_dose_fractionation(&self, preset: Preset, enabled: bool) -> Result<()> {
        self.command(
            "SetDoseFracParams",
            &[json!(preset.code()), json!(i64::from(enabled))],
        )
        .await
    }

    async fn probe_mode(&self) -> Result<ProbeMode> {
        let values = self.call("ReportProbeMode", &[]).await?;
        let first = values
            .first()
            .ok_or_else(|| anyhow!("ReportProbeMode returned no value"))?;
        match first {
            Value::String(s) => s.parse(),
            other => other.to_string().parse(),
        }
    }

    async fn set_probe_mode(&self, mode: ProbeMode) -> Result<()> {
        self.command("SetProbeMode", &[json!(mode.as_str())]).await
    }

    async fn magnification(&self) -> Result<u32> {
        self.query_u32("ReportMag", &[]).await
    }

    async fn set_magnification(&self, mag: u32) -> Result<()> {
        self.command("SetMag", &[json!(mag)]).await
    }

    async fn spot_size(&self) -> Result<u32> {
        self.query_u32("ReportSpotSize", &[]).await
    }

    async fn set_spot_size(&self, spot: u32) -> Result<()> {
        self.command("SetSpotSize", &[json!(spot)]).await
    }

    async fn percent_c2(&self) -> Result<f64> {
        self.query_f64("ReportPercentC2", &[]).await
    }

    async fn set_percent_c2(&self, percent: f64) -> Result<()> {
        self.command("SetPercentC2", &[json!(percent)]).await
    }

    async fn illuminated_area(&self) -> Result<f64> {
        self.query_f64("ReportIlluminatedArea", &[]).await
    }

    async fn set_illuminated_area(&self, area: f64) -> Result<()> {
        self.command("SetIlluminatedArea", &[json!(area)]).await
    }

    async fn normalize_lenses(&self) -> Result<()> {
        self.command("NormalizeLenses", &[json!(7)]).await
    }

    async fn focus_shot(&self) -> Result<()> {
        self.command("Focus", &[]).await
    }

    async fn electrons_per_pixel_per_second(&self) -> Result<f64> {
        // ElectronStats reports min, max, mean, sd and then e/px/s.
        let v = self.query_values("ElectronStats", &[json!("A")], 5).await?;
        Ok(v[4])
    }

    async fn mean_counts(&self) -> Result<f64> {
        self.query_f64("ReportMeanCounts", &[json!("A")]).await
    }

    async fn autofocus(&self, mode: FocusMode) -> Result<()> {
        self.command("AutoFocus", &[json!(mode.code())]).await
    }

    async fn last_autofocus(&self) -> Result<f64> {
        self.query_f64("ReportAutoFocus", &[]).await
    }

    async fn focus_drift(&self) -> Result<(f64, f64)> {
        self.query_pair("ReportFocusDrift", &[]).await
    }

    async fn autofocus_offset(&self) -> Result<f64> {
        self.query_f64("ReportAutofocusOffset", &[]).await
    }

    async fn set_autofocus_offset(&self, microns: f64) -> Result<()> {
        self.command("SetAutofocusOffset", &[json!(microns)]).await
    }

    async fn set_target_defocus(&self, microns: f64) -> Result<()> {
        self.command("SetTargetDefocus", &[json!(microns)]).await
    }

    async fn save_focus(&self) -> Result<()> {
        self.command("SaveFocus", &[]).await
    }

    async fn restore_focus(&self) -> Result<()> {
        self.command("RestoreFocus", &[]).await
    }

    async fn set_eucentric_focus(&self) -> Result<()> {
        self.command("SetEucentricFocus", &[]).await
    }

    async fn fix_astigmatism_by_ctf(&self) -> Result<()> {
        self.command("FixAstigmatismByCTF", &[]).await
    }

    async fn fix_coma_by_ctf(&self) -> Result<()> {
        self.command("FixComaByCTF", &[]).await
    }

    async fn stigmator_needed(&self) -> Result<(f64, f64)> {
        self.query_pair("ReportStigmatorNeeded", &[]).await
    }

    async fn coma_tilt_needed(&self) -> Result<(f64, f64)> {
        self.query_pair("ReportComaTiltNeeded", &[]).await
    }

    async fn drift_wait(&self, criterion: f64, timeout_s: f64, interval_s: f64) -> Result<bool> {
        self.query_bool(
            "DriftWaitTask",
            &[
                json!(criterion),
                json!("A"),
                json!(timeout_s),
                json!(interval_s),
                json!(1),
                json!("A"),
            ],
        )
        .await
    }

    async fn stage_position(&self) -> Result<(f64, f64, f64)> {
        let v = self.query_values("ReportStageXYZ", &[], 3).await?;
        Ok((v[0], v[1], v[2]))
    }

    async fn move_stage(&self, dx: f64, dy: f64, dz: f64) -> Result<()> {
        self.command("MoveStage", &[json!(dx), json!(dy), json!(dz)])
            .await
    }

    async fn tilt_angle(&self) -> Result<f64> {
        self.query_f64("ReportTiltAngle", &[]).await
    }

    async fn tilt_to(&self, degrees: f64) -> Result<()> {
        self.command("TiltTo", &[json!(degrees)]).await
    }

    async fn image_shift(&self) -> Result<(f64, f64)> {
        self.query_pair("ReportImageShift", &[]).await
    }

    async fn set_image_shift(&self, x: f64, y: f64) -> Result<()> {
        self.command("SetImageShift", &[json!(x), json!(y)]).await
    }

    async fn eucentricity(&self, mode: EucentricityMode) -> Result<()> {
        self.command("Eucentricity", &[json!(mode.code())]).await
    }

    async fn aperture_size(&self, kind: ApertureKind) -> Result<u32> {
        self.query_u32("ReportApertureSize", &[json!(kind.number())])
            .await
    }

    async fn set_aperture_size(&self, kind: ApertureKind, microns: u32) -> Result<()> {
        self.command("SetApertureSize", &[json!(kind.number()), json!(microns)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Answer each request line with the reply produced by `respond`.
    async fn spawn_server<F>(respond: F) -> u16
    where
        F: Fn(&str, &[Value]) -> Value + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let cmd = request["cmd"].as_str().unwrap().to_string();
                let args = request["args"].as_array().cloned().unwrap_or_default();
                let mut reply = respond(&cmd, &args);
                reply["id"] = request["id"].clone();
                let mut out = reply.to_string();
                out.push('\n');
                write_half.write_all(out.as_bytes()).await.unwrap();
            }
        });
        port
    }

    fn settings(port: u16) -> ConnectionSettings {
        ConnectionSettings {
            host: "127.0.0.1".to_string(),
            port,
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn queries_and_commands_round_trip() {
        let port = spawn_server(|cmd, args| match cmd {
            "ReportSpotSize" => json!({"ok": true, "values": [5]}),
            "SetMag" => {
                assert_eq!(args[0], json!(96000));
                json!({"ok": true, "values": []})
            }
            "ElectronStats" => json!({"ok": true, "values": [0, 10, 4.2, 1.1, 480.0]}),
            "ReportStageXYZ" => json!({"ok": true, "values": [1.5, -2.0, 0.25]}),
            _ => json!({"ok": false, "error": "unknown command"}),
        })
        .await;

        let client = SemClient::connect(&settings(port)).await.unwrap();
        assert_eq!(client.spot_size().await.unwrap(), 5);
        client.set_magnification(96000).await.unwrap();
        assert_eq!(client.electrons_per_pixel_per_second().await.unwrap(), 480.0);
        assert_eq!(client.stage_position().await.unwrap(), (1.5, -2.0, 0.25));
    }

    #[tokio::test]
    async fn server_rejection_becomes_error() {
        let port = spawn_server(|_, _| json!({"ok": false, "error": "Not available"})).await;
        let client = SemClient::connect(&settings(port)).await.unwrap();

        let err = client.illuminated_area().await.unwrap_err();
        assert!(err.to_string().contains("Not available"));
        // connection stays usable after a rejected command
        assert!(client.dewars_filling().await.is_err());
    }

    #[tokio::test]
    async fn unreachable_server_is_connection_error() {
        // Bind and drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = SemClient::connect(&settings(port)).await;
        assert!(matches!(result, Err(EmError::Connection { .. })));
    }

    #[test]
    fn numeric_values_accept_strings_and_bools() {
        assert_eq!(as_f64(&json!("2.5")), Some(2.5));
        assert_eq!(as_f64(&json!(true)), Some(1.0));
        assert_eq!(as_f64(&json!(null)), None);
    }
}
