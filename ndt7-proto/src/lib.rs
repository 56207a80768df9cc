//! ndt7 wire protocol - shared constants and the measurement schema

use std::time::Duration;

/// Maximum duration of a download test. Every component serving the test,
/// the counter-flow receiver included, must stop by then.
pub const MAX_RUNTIME: Duration = Duration::from_secs(15);

/// Largest client frame the server accepts (128 KiB).
pub const MAX_MESSAGE_SIZE: usize = 1 << 17;

/// Application level byte counter, as seen by whoever produced the sample
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppInfo {
    pub num_bytes: i64,
    /// Microseconds since the start of the test
    pub elapsed_time: i64,
}

/// Endpoints of the measured connection
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectionInfo {
    pub client: String,
    pub server: String,
    #[serde(rename = "UUID", skip_serializing_if = "String::is_empty")]
    pub uuid: String,
}

/// BBR congestion control state
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct BbrInfo {
    #[serde(rename = "BW")]
    pub bw: i64,
    #[serde(rename = "MinRTT")]
    pub min_rtt: u32,
    pub pacing_gain: u32,
    pub cwnd_gain: u32,
    pub elapsed_time: i64,
}

/// Subset of the Linux `tcp_info` counters a client may report.
///
/// Clients are free to send more of them; unknown members are ignored.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct TcpInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<u8>,
    #[serde(rename = "CAState", skip_serializing_if = "Option::is_none")]
    pub ca_state: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retransmits: Option<u8>,
    #[serde(rename = "RTO", skip_serializing_if = "Option::is_none")]
    pub rto: Option<u32>,
    #[serde(rename = "SndMSS", skip_serializing_if = "Option::is_none")]
    pub snd_mss: Option<u32>,
    #[serde(rename = "RcvMSS", skip_serializing_if = "Option::is_none")]
    pub rcv_mss: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unacked: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrans: Option<u32>,
    #[serde(rename = "RTT", skip_serializing_if = "Option::is_none")]
    pub rtt: Option<u32>,
    #[serde(rename = "RTTVar", skip_serializing_if = "Option::is_none")]
    pub rtt_var: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snd_cwnd: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_retrans: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pacing_rate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_acked: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_retrans: Option<i64>,
    #[serde(rename = "MinRTT", skip_serializing_if = "Option::is_none")]
    pub min_rtt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_rate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy_time: Option<i64>,
    #[serde(rename = "RWndLimited", skip_serializing_if = "Option::is_none")]
    pub rwnd_limited: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snd_buf_limited: Option<i64>,
    pub elapsed_time: i64,
}

/// One status report sent by a client over the counter-flow channel.
///
/// The server treats it as opaque: nothing here is checked for plausibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Measurement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_info: Option<AppInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<ConnectionInfo>,
    #[serde(rename = "BBRInfo", default, skip_serializing_if = "Option::is_none")]
    pub bbr_info: Option<BbrInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(rename = "TCPInfo", default, skip_serializing_if = "Option::is_none")]
    pub tcp_info: Option<TcpInfo>,
}

impl Measurement {
    /// Decode one text frame body. Only a JSON object is a measurement.
    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        // serde would otherwise accept the struct in sequence form
        if body.trim_start().starts_with('[') {
            return Err(serde::de::Error::invalid_type(
                serde::de::Unexpected::Seq,
                &"a measurement object",
            ));
        }
        serde_json::from_str(body)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
