use stream::Reading;

/// A batch of readings rendered into the wire form one [`crate::WriteTarget`]
/// expects, plus the count the caller needs for metrics without re-parsing
/// the payload.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    /// Number of readings this payload represents.
    pub reading_count: usize,
    /// The serialised payload, ready to send as-is.
    pub body: String,
}

fn quality_tag(quality: metrics::Quality) -> &'static str {
    match quality {
        metrics::Quality::Good => "good",
        metrics::Quality::Uncertain => "uncertain",
        metrics::Quality::Bad => "bad",
        metrics::Quality::ConfigurationError => "configuration_error",
        metrics::Quality::Overflow => "overflow",
    }
}

fn escape_tag_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace(',', "\\,").replace(' ', "\\ ").replace('=', "\\=")
}

fn escape_measurement(value: &str) -> String {
    value.replace('\\', "\\\\").replace(',', "\\,").replace(' ', "\\ ")
}

/// Renders a batch of readings as InfluxDB line protocol: one line per
/// reading, tag set sorted for deterministic output, nanosecond timestamps,
/// and the field set named per the external interface (`raw`, `value`,
/// `rate`, `quality`), omitting `rate` entirely when it is null.
pub fn encode_line_protocol(readings: &[Reading], measurement: &str) -> EncodedBatch {
    let mut body = String::new();

    for reading in readings {
        body.push_str(&escape_measurement(measurement));

        let mut tags: Vec<(&str, String)> = vec![
            ("device_id", reading.device_id.clone()),
            ("channel", reading.channel_number.to_string()),
            ("quality", quality_tag(reading.quality).to_string()),
        ];
        for (key, value) in &reading.tags {
            tags.push((key.as_str(), value.clone()));
        }
        tags.sort_by(|a, b| a.0.cmp(b.0));

        for (key, value) in &tags {
            body.push(',');
            body.push_str(&escape_tag_value(key));
            body.push('=');
            body.push_str(&escape_tag_value(value));
        }

        body.push(' ');
        body.push_str(&format!(
            "raw={}i,value={},overflow_offset={}i",
            reading.raw_value, reading.processed_value, reading.overflow_offset
        ));
        if let Some(rate) = reading.rate_per_second {
            body.push_str(&format!(",rate={rate}"));
        }

        let nanos = reading
            .timestamp
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        body.push(' ');
        body.push_str(&nanos.to_string());
        body.push('\n');
    }

    EncodedBatch {
        reading_count: readings.len(),
        body,
    }
}

/// One row of the TimescaleDB representation named in the external
/// interface: `(time, device_id, channel, raw_value, processed_value,
/// rate, quality, tags_jsonb)`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TimescaleRow {
    /// UTC timestamp of the underlying reading.
    pub time: std::time::SystemTime,
    /// Owning device.
    pub device_id: String,
    /// Channel within the device.
    pub channel: i32,
    /// Overflow-adjusted raw counter value.
    pub raw_value: i64,
    /// Scaled, rounded value.
    pub processed_value: f64,
    /// Instantaneous rate, if known.
    pub rate: Option<f64>,
    /// Quality classification, as its wire string.
    pub quality: String,
    /// Merged device/channel tags, as a JSON object.
    pub tags_jsonb: serde_json::Value,
}

/// Converts a batch of readings into TimescaleDB row tuples, ready for a
/// batched `INSERT ... VALUES` or `COPY`.
pub fn encode_rows(readings: &[Reading]) -> Vec<TimescaleRow> {
    readings
        .iter()
        .map(|reading| TimescaleRow {
            time: reading.timestamp,
            device_id: reading.device_id.clone(),
            channel: i32::from(reading.channel_number),
            raw_value: reading.raw_value,
            processed_value: reading.processed_value,
            rate: reading.rate_per_second,
            quality: quality_tag(reading.quality).to_string(),
            tags_jsonb: serde_json::to_value(&reading.tags).unwrap_or(serde_json::Value::Null),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::time::SystemTime;

    use metrics::Quality;

    use super::*;

    fn reading() -> Reading {
        let mut tags = HashMap::new();
        let _ = tags.insert("site".to_string(), "plant-a".to_string());
        Reading {
            device_id: "line-1".to_string(),
            channel_number: 2,
            timestamp: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1),
            raw_value: 42,
            overflow_offset: 7,
            processed_value: 4.2,
            rate_per_second: Some(1.5),
            quality: Quality::Good,
            tags,
        }
    }

    #[test]
    fn line_protocol_contains_measurement_tags_and_fields() {
        let batch = encode_line_protocol(&[reading()], "counter_data");
        assert_eq!(batch.reading_count, 1);
        assert!(batch.body.starts_with("counter_data,"));
        assert!(batch.body.contains("device_id=line-1"));
        assert!(batch.body.contains("channel=2"));
        assert!(batch.body.contains("quality=good"));
        assert!(batch.body.contains("site=plant-a"));
        assert!(batch.body.contains("raw=42i"));
        assert!(batch.body.contains("value=4.2"));
        assert!(batch.body.contains("overflow_offset=7i"));
        assert!(batch.body.contains("rate=1.5"));
        assert!(batch.body.ends_with("1000000000\n"));
    }

    #[test]
    fn null_rate_is_omitted_from_line_protocol() {
        let mut r = reading();
        r.rate_per_second = None;
        let batch = encode_line_protocol(&[r], "counter_data");
        assert!(!batch.body.contains("rate="));
    }

    #[test]
    fn row_encoding_preserves_values() {
        let rows = encode_rows(&[reading()]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_id, "line-1");
        assert_eq!(rows[0].channel, 2);
        assert_eq!(rows[0].raw_value, 42);
        assert_eq!(rows[0].quality, "good");
    }
}
