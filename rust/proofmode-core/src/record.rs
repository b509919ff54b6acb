//! The proof record: an ordered key/value description of one media file and
//! the device that captured it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::time::Duration;

pub const DELIMITER: char = ',';
pub const NONE_VALUE: &str = "none";

pub const DEFAULT_POLL_ATTEMPTS: u32 = 3;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_id: String,
    pub wifi_mac: String,
    pub ipv4: String,
    pub ipv6: String,
    pub data_type: String,
    pub network: String,
    pub network_type: String,
    pub hardware: String,
    pub manufacturer: String,
    pub screen_size: String,
    pub language: String,
    pub locale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationMetadata {
    pub latitude: f64,
    pub longitude: f64,
    pub provider: String,
    pub accuracy: f64,
    pub altitude: f64,
    pub bearing: f64,
    pub speed: f64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub passed: bool,
    pub basic_integrity: bool,
    pub cts_match: bool,
    pub timestamp: DateTime<Utc>,
}

/// Where device, location and attestation metadata comes from. Collection
/// itself belongs to the embedding platform.
pub trait MetadataSource: Send + Sync {
    fn device(&self) -> Option<DeviceMetadata>;
    fn location(&self) -> Option<LocationMetadata>;
    fn cell_info(&self) -> Option<String>;
    fn safety_check(&self) -> Option<SafetyCheck>;
}

/// Fixed metadata, e.g. supplied by a caller that already collected it.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    pub device: Option<DeviceMetadata>,
    pub location: Option<LocationMetadata>,
    pub cell_info: Option<String>,
    pub safety_check: Option<SafetyCheck>,
}

impl StaticMetadata {
    /// What a desktop host can say about itself: no location, no cell, no
    /// platform attestation.
    pub fn host() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        let locale = std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .unwrap_or_default();
        let language = locale
            .split(['_', '.', '-'])
            .next()
            .unwrap_or_default()
            .to_string();

        Self {
            device: Some(DeviceMetadata {
                device_id: hex::encode(&crate::hashing::sha256_bytes(hostname.as_bytes())[..8]),
                hardware: std::env::consts::ARCH.to_string(),
                manufacturer: std::env::consts::OS.to_string(),
                data_type: "file".to_string(),
                language,
                locale,
                ..DeviceMetadata::default()
            }),
            ..Self::default()
        }
    }
}

impl MetadataSource for StaticMetadata {
    fn device(&self) -> Option<DeviceMetadata> {
        self.device.clone()
    }

    fn location(&self) -> Option<LocationMetadata> {
        self.location.clone()
    }

    fn cell_info(&self) -> Option<String> {
        self.cell_info.clone()
    }

    fn safety_check(&self) -> Option<SafetyCheck> {
        self.safety_check.clone()
    }
}

/// Asks `source` for a location fix up to `attempts` times, `interval`
/// apart.
pub async fn poll_location(
    source: &dyn MetadataSource,
    attempts: u32,
    interval: Duration,
) -> Option<LocationMetadata> {
    for attempt in 0..attempts {
        if let Some(location) = source.location() {
            return Some(location);
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    log::debug!("No location after {attempts} attempts");
    None
}

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn escape(value: &str) -> String {
    value.replace([DELIMITER, '\r', '\n'], " ")
}

/// Immutable, insertion-ordered field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofRecord {
    fields: Vec<(String, String)>,
}

impl ProofRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn csv_header(&self) -> String {
        let mut out = self
            .fields
            .iter()
            .map(|(k, _)| escape(k))
            .collect::<Vec<_>>()
            .join(",");
        out.push('\n');
        out
    }

    /// One data line, preceded by the header line when `write_header`.
    pub fn to_csv(&self, write_header: bool) -> String {
        let mut out = if write_header {
            self.csv_header()
        } else {
            String::new()
        };
        let row = self
            .fields
            .iter()
            .map(|(_, v)| escape(v))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&row);
        out.push('\n');
        out
    }

    /// A data line laid out for an existing header: one value per column,
    /// blank where this record has no such field.
    pub fn to_csv_row(&self, columns: &[&str]) -> String {
        let mut out = columns
            .iter()
            .map(|c| self.get(c).map(escape).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");
        out.push('\n');
        out
    }

    /// A single-line JSON object with the fields in record order.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Serialize for ProofRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

pub struct ProofRecordBuilder {
    digest: [u8; 32],
    file_path: String,
    file_modified: DateTime<Utc>,
    generated_at: DateTime<Utc>,
    device: Option<DeviceMetadata>,
    location: Option<LocationMetadata>,
    cell_info: Option<String>,
    safety_check: Option<SafetyCheck>,
    notes: String,
    track_device_id: bool,
}

impl ProofRecordBuilder {
    pub fn new(
        digest: [u8; 32],
        file_path: impl Into<String>,
        file_modified: DateTime<Utc>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            digest,
            file_path: file_path.into(),
            file_modified,
            generated_at,
            device: None,
            location: None,
            cell_info: None,
            safety_check: None,
            notes: String::new(),
            track_device_id: false,
        }
    }

    pub fn device(mut self, device: Option<DeviceMetadata>) -> Self {
        self.device = device;
        self
    }

    pub fn location(mut self, location: Option<LocationMetadata>) -> Self {
        self.location = location;
        self
    }

    pub fn cell_info(mut self, cell_info: Option<String>) -> Self {
        self.cell_info = cell_info;
        self
    }

    pub fn safety_check(mut self, safety_check: Option<SafetyCheck>) -> Self {
        self.safety_check = safety_check;
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn track_device_id(mut self, track: bool) -> Self {
        self.track_device_id = track;
        self
    }

    pub fn build(self) -> ProofRecord {
        let mut fields: Vec<(String, String)> = Vec::with_capacity(32);
        let mut put = |k: &str, v: String| fields.push((k.to_string(), v));

        put("File Path", self.file_path);
        put("File Hash SHA256", hex::encode(self.digest));
        put("File Modified", format_time(&self.file_modified));
        put("Proof Generated", format_time(&self.generated_at));

        let device = self.device.unwrap_or_default();
        if self.track_device_id {
            put("DeviceID", device.device_id);
            put("Wifi MAC", device.wifi_mac);
        }
        put("IPv4", device.ipv4);
        put("IPv6", device.ipv6);
        put("DataType", device.data_type);
        put("Network", device.network);
        put("NetworkType", device.network_type);
        put("Hardware", device.hardware);
        put("Manufacturer", device.manufacturer);
        put("ScreenSize", device.screen_size);
        put("Language", device.language);
        put("Locale", device.locale);

        match self.location {
            Some(loc) => {
                put("Location.Latitude", loc.latitude.to_string());
                put("Location.Longitude", loc.longitude.to_string());
                put("Location.Provider", loc.provider);
                put("Location.Accuracy", loc.accuracy.to_string());
                put("Location.Altitude", loc.altitude.to_string());
                put("Location.Bearing", loc.bearing.to_string());
                put("Location.Speed", loc.speed.to_string());
                put("Location.Time", format_time(&loc.time));
            }
            None => {
                for key in [
                    "Location.Latitude",
                    "Location.Longitude",
                    "Location.Provider",
                    "Location.Accuracy",
                    "Location.Altitude",
                    "Location.Bearing",
                    "Location.Speed",
                    "Location.Time",
                ] {
                    put(key, NONE_VALUE.to_string());
                }
            }
        }

        put(
            "CellInfo",
            self.cell_info.unwrap_or_else(|| NONE_VALUE.to_string()),
        );

        match self.safety_check {
            Some(check) => {
                put("SafetyCheck", check.passed.to_string());
                put("SafetyCheckBasicIntegrity", check.basic_integrity.to_string());
                put("SafetyCheckCtsMatch", check.cts_match.to_string());
                put("SafetyCheckTimestamp", format_time(&check.timestamp));
            }
            None => {
                for key in [
                    "SafetyCheck",
                    "SafetyCheckBasicIntegrity",
                    "SafetyCheckCtsMatch",
                    "SafetyCheckTimestamp",
                ] {
                    put(key, String::new());
                }
            }
        }

        put("Notes", self.notes);
        ProofRecord { fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn time(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn builder() -> ProofRecordBuilder {
        ProofRecordBuilder::new([0xab; 32], "/sdcard/DCIM/img.jpg", time(1_700_000_000), time(1_700_000_060))
    }

    fn location() -> LocationMetadata {
        LocationMetadata {
            latitude: 52.52,
            longitude: 13.405,
            provider: "gps".into(),
            accuracy: 4.5,
            altitude: 34.0,
            bearing: 0.0,
            speed: 0.0,
            time: time(1_700_000_030),
        }
    }

    #[test]
    fn test_field_order_without_device_id() {
        let record = builder().build();
        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys[..5], ["File Path", "File Hash SHA256", "File Modified", "Proof Generated", "IPv4"]);
        assert_eq!(keys.last(), Some(&"Notes"));
        assert_eq!(record.len(), 28);
        assert!(record.get("DeviceID").is_none());

        assert_eq!(record.get("File Hash SHA256"), Some("ab".repeat(32).as_str()));
        assert_eq!(record.get("File Modified"), Some("2023-11-14T22:13:20.000Z"));
        assert_eq!(record.get("Location.Latitude"), Some("none"));
        assert_eq!(record.get("CellInfo"), Some("none"));
        assert_eq!(record.get("SafetyCheck"), Some(""));
        assert_eq!(record.get("Hardware"), Some(""));
    }

    #[test]
    fn test_device_id_tracking_and_groups() {
        let record = builder()
            .track_device_id(true)
            .device(Some(DeviceMetadata {
                device_id: "abc123".into(),
                wifi_mac: "02:00:00:00:00:00".into(),
                hardware: "pixel".into(),
                ..DeviceMetadata::default()
            }))
            .location(Some(location()))
            .cell_info(Some("lte:262-01".into()))
            .safety_check(Some(SafetyCheck {
                passed: true,
                basic_integrity: true,
                cts_match: false,
                timestamp: time(1_700_000_000),
            }))
            .notes("hello")
            .build();

        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys[4..6], ["DeviceID", "Wifi MAC"]);
        assert_eq!(record.len(), 30);
        assert_eq!(record.get("DeviceID"), Some("abc123"));
        assert_eq!(record.get("Location.Latitude"), Some("52.52"));
        assert_eq!(record.get("Location.Provider"), Some("gps"));
        assert_eq!(record.get("CellInfo"), Some("lte:262-01"));
        assert_eq!(record.get("SafetyCheckCtsMatch"), Some("false"));
        assert_eq!(record.get("Notes"), Some("hello"));
    }

    #[test]
    fn test_csv_escaping_keeps_columns() {
        let record = builder()
            .notes("line one,\r\nline two, with commas")
            .build();
        let csv = record.to_csv(true);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].split(',').count(), record.len());
        assert_eq!(lines[1].split(',').count(), record.len());
        assert!(lines[1].ends_with("line one   line two  with commas"));

        let row_only = record.to_csv(false);
        assert_eq!(row_only, format!("{}\n", lines[1]));
    }

    #[test]
    fn test_csv_row_for_other_columns() {
        let record = builder().notes("n").build();
        let row = record.to_csv_row(&["Notes", "DeviceID", "File Hash SHA256"]);
        assert_eq!(row, format!("n,,{}\n", "ab".repeat(32)));
        assert_eq!(record.to_csv_row(&[]), "\n");
    }

    #[test]
    fn test_json_matches_csv_mapping() {
        let record = builder().location(Some(location())).notes("a\nb").build();
        let json = record.to_json().unwrap();
        assert!(!json.contains('\n'));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), record.len());
        for (k, v) in record.iter() {
            assert_eq!(object[k], v);
        }
        // insertion order survives
        assert!(json.starts_with("{\"File Path\":"));
    }

    struct FlakyGps {
        calls: AtomicU32,
        fix_on: u32,
    }

    impl MetadataSource for FlakyGps {
        fn device(&self) -> Option<DeviceMetadata> {
            None
        }

        fn location(&self) -> Option<LocationMetadata> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (call >= self.fix_on).then(location)
        }

        fn cell_info(&self) -> Option<String> {
            None
        }

        fn safety_check(&self) -> Option<SafetyCheck> {
            None
        }
    }

    #[tokio::test]
    async fn test_poll_location() {
        let gps = FlakyGps {
            calls: AtomicU32::new(0),
            fix_on: 2,
        };
        let fix = poll_location(&gps, 3, Duration::from_millis(1)).await;
        assert_eq!(fix, Some(location()));
        assert_eq!(gps.calls.load(Ordering::SeqCst), 2);

        let never = FlakyGps {
            calls: AtomicU32::new(0),
            fix_on: u32::MAX,
        };
        assert!(poll_location(&never, 3, Duration::from_millis(1)).await.is_none());
        assert_eq!(never.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_host_metadata_has_device_group() {
        let host = StaticMetadata::host();
        let device = host.device().unwrap();
        assert_eq!(device.hardware, std::env::consts::ARCH);
        assert!(host.location().is_none());
    }
}
