#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The stream processor (C5): turns each [`device::RawFrame`] into a
//! [`Reading`] by decoding, compensating for counter rollover, computing a
//! sliding-window rate, and classifying data quality.

mod algorithm;
mod rate;

use std::collections::HashMap;
use std::time::SystemTime;

use config::DeviceConfig;
use device::{RawFrame, RawFrameCause};
use metrics::{MetricsRegistry, Quality};

use algorithm::{decode, detect_overflow, round_to, saturating_adjust, worst};
use rate::RateWindow;

/// One processed data point, ready for the writer.
#[derive(Debug, Clone)]
pub struct Reading {
    /// Owning device.
    pub device_id: String,
    /// Channel within the device.
    pub channel_number: u16,
    /// Wall-clock time the underlying frame was acquired.
    pub timestamp: SystemTime,
    /// Overflow-adjusted decoded counter value.
    pub raw_value: i64,
    /// Accumulated wrap adjustment folded into `raw_value`, published so
    /// downstream consumers can tell a genuine wrap from a counter reset.
    pub overflow_offset: i64,
    /// `raw_value * scale_factor + offset`, rounded to `decimal_places`.
    pub processed_value: f64,
    /// Instantaneous rate over the channel's sliding window, if enough
    /// samples have been seen.
    pub rate_per_second: Option<f64>,
    /// Trust classification for this reading.
    pub quality: Quality,
    /// Device tags merged with channel tags.
    pub tags: HashMap<String, String>,
}

/// The static per-channel configuration the processor needs at decode
/// time, decoupled from [`config::ChannelConfig`] so the processor never
/// has to reach back into validation-only fields.
#[derive(Debug, Clone)]
struct ChannelSpec {
    data_type: config::DataType,
    register_count: u8,
    scale_factor: f64,
    offset: f64,
    decimal_places: u8,
    min_value: f64,
    max_value: f64,
    max_change_rate: Option<f64>,
}

/// Per-channel running state carried between frames.
#[derive(Debug, Default)]
struct ChannelState {
    /// Previous decoded (unadjusted) register value, bounded within the
    /// register width. Distinct from the published `raw_value`, which
    /// keeps growing across overflows.
    last_decoded: Option<u64>,
    overflow_offset: i64,
    rate_window: RateWindow,
    consecutive_bad: u32,
}

struct ChannelEntry {
    spec: ChannelSpec,
    tags: HashMap<String, String>,
    state: ChannelState,
}

/// Decodes, compensates, and classifies frames for every registered
/// device. One instance is shared by the whole process; `process` is the
/// sole mutating entry point and is not safe to call concurrently for the
/// same channel from two tasks.
pub struct StreamProcessor {
    channels: HashMap<(String, u16), ChannelEntry>,
    metrics: MetricsRegistry,
}

impl StreamProcessor {
    /// Creates an empty processor reporting into `metrics`.
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            channels: HashMap::new(),
            metrics,
        }
    }

    /// Registers every enabled channel of `device`, replacing any prior
    /// state for the same `(device_id, channel_number)` keys. Used both on
    /// initial pool startup and on a config hot-reload that adds or
    /// updates a device.
    pub fn register_device(&mut self, device: &DeviceConfig) {
        for channel in &device.channels {
            if !channel.enabled {
                continue;
            }

            let mut tags = device.tags.clone();
            tags.extend(channel.tags.clone());

            let _ = self.channels.insert(
                (device.device_id.clone(), channel.channel_number),
                ChannelEntry {
                    spec: ChannelSpec {
                        data_type: channel.data_type,
                        register_count: channel.register_count,
                        scale_factor: channel.scale_factor,
                        offset: channel.offset,
                        decimal_places: channel.decimal_places,
                        min_value: channel.min_value,
                        max_value: channel.max_value,
                        max_change_rate: channel.max_change_rate,
                    },
                    tags,
                    state: ChannelState::default(),
                },
            );
        }
    }

    /// Drops every channel belonging to `device_id`, e.g. on
    /// `DevicePool::remove`.
    pub fn unregister_device(&mut self, device_id: &str) {
        self.channels.retain(|(owner, _), _| owner != device_id);
    }

    /// Processes one frame into a reading, updating the channel's running
    /// state in place.
    pub fn process(&mut self, frame: RawFrame) -> Reading {
        let key = (frame.device_id.clone(), frame.channel_number);
        let timestamp = frame.acquired_at.wall_clock;

        let Some(entry) = self.channels.get_mut(&key) else {
            tracing::warn!(
                device_id = %frame.device_id,
                channel_number = frame.channel_number,
                "frame arrived for an unregistered channel"
            );
            let reading = Reading {
                device_id: frame.device_id,
                channel_number: frame.channel_number,
                timestamp,
                raw_value: 0,
                overflow_offset: 0,
                processed_value: 0.0,
                rate_per_second: None,
                quality: Quality::ConfigurationError,
                tags: HashMap::new(),
            };
            self.metrics.record_reading(reading.quality);
            return reading;
        };

        if let RawFrameCause::Bad { .. } = &frame.cause {
            entry.state.consecutive_bad += 1;
            let raw_value = saturating_adjust(entry.state.last_decoded.unwrap_or(0), entry.state.overflow_offset);
            let processed_value = round_to(raw_value as f64 * entry.spec.scale_factor + entry.spec.offset, entry.spec.decimal_places);
            let reading = Reading {
                device_id: frame.device_id.clone(),
                channel_number: frame.channel_number,
                timestamp,
                raw_value,
                overflow_offset: entry.state.overflow_offset,
                processed_value,
                rate_per_second: None,
                quality: Quality::Bad,
                tags: entry.tags.clone(),
            };
            self.metrics.record_reading(reading.quality);
            return reading;
        }

        let mut contributions = Vec::new();

        if frame.registers.len() != entry.spec.register_count as usize {
            contributions.push(Quality::ConfigurationError);
        }
        if entry.state.consecutive_bad >= 1 {
            contributions.push(Quality::Uncertain);
        }

        let decoded = if frame.registers.len() == entry.spec.register_count as usize {
            decode(&frame.registers, entry.spec.data_type)
        } else {
            entry.state.last_decoded.unwrap_or(0)
        };

        let outcome = detect_overflow(entry.state.last_decoded, decoded, entry.spec.register_count, entry.state.overflow_offset);
        entry.state.overflow_offset = outcome.overflow_offset;
        if let Some(quality) = outcome.quality {
            if quality == Quality::Overflow {
                self.metrics.record_overflow_event(&frame.device_id, frame.channel_number);
            }
            contributions.push(quality);
        }

        let raw_value = saturating_adjust(decoded, entry.state.overflow_offset);
        let processed_value = round_to(raw_value as f64 * entry.spec.scale_factor + entry.spec.offset, entry.spec.decimal_places);

        if processed_value < entry.spec.min_value || processed_value > entry.spec.max_value {
            contributions.push(Quality::Bad);
        }

        entry.state.rate_window.push(frame.acquired_at.monotonic, raw_value);
        let rate_per_second = entry.state.rate_window.rate();

        if let (Some(rate), Some(limit)) = (rate_per_second, entry.spec.max_change_rate) {
            if rate.abs() > limit {
                contributions.push(Quality::Uncertain);
            }
        }

        let quality = worst(&contributions);

        entry.state.last_decoded = Some(decoded);
        entry.state.consecutive_bad = if quality == Quality::Good { 0 } else { entry.state.consecutive_bad + 1 };

        self.metrics.record_reading(quality);

        Reading {
            device_id: frame.device_id,
            channel_number: frame.channel_number,
            timestamp,
            raw_value,
            overflow_offset: entry.state.overflow_offset,
            processed_value,
            rate_per_second,
            quality,
            tags: entry.tags.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use config::{ChannelConfig, DataType};
    use device::AcquiredAt;

    use super::*;

    fn device(channels: Vec<ChannelConfig>) -> DeviceConfig {
        DeviceConfig {
            device_id: "line-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            timeout_ms: 200,
            poll_interval_ms: 1000,
            max_retries: 3,
            retry_backoff_ms: 250,
            enabled: true,
            channels,
            tags: HashMap::new(),
        }
    }

    fn channel(channel_number: u16, data_type: DataType) -> ChannelConfig {
        ChannelConfig {
            channel_number,
            name: format!("ch{channel_number}"),
            start_register: 0,
            register_count: data_type.register_count(),
            data_type,
            scale_factor: 1.0,
            offset: 0.0,
            decimal_places: 0,
            min_value: 0.0,
            max_value: 1_000_000_000.0,
            max_change_rate: None,
            enabled: true,
            tags: HashMap::new(),
        }
    }

    fn frame(channel_number: u16, registers: Vec<u16>, cause: RawFrameCause) -> RawFrame {
        RawFrame {
            device_id: "line-1".to_string(),
            channel_number,
            registers,
            acquired_at: AcquiredAt::now(),
            acquisition_duration: Duration::from_millis(5),
            cause,
        }
    }

    #[test]
    fn happy_path_produces_a_good_reading() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        processor.register_device(&device(vec![channel(0, DataType::UInt16)]));

        let reading = processor.process(frame(0, vec![42], RawFrameCause::Ok));
        assert_eq!(reading.raw_value, 42);
        assert_eq!(reading.processed_value, 42.0);
        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(reading.rate_per_second, None);
    }

    #[test]
    fn sixteen_bit_overflow_is_compensated_and_flagged() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        processor.register_device(&device(vec![channel(0, DataType::UInt16)]));

        let _ = processor.process(frame(0, vec![65530], RawFrameCause::Ok));
        let reading = processor.process(frame(0, vec![5], RawFrameCause::Ok));

        assert_eq!(reading.raw_value, 65541);
        assert_eq!(reading.overflow_offset, 65536);
        assert_eq!(reading.quality, Quality::Overflow);
    }

    #[test]
    fn thirty_two_bit_overflow_is_compensated_and_flagged() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        processor.register_device(&device(vec![channel(0, DataType::UInt32LowHigh)]));

        let low = (4_294_967_290u64 & 0xffff) as u16;
        let high = (4_294_967_290u64 >> 16) as u16;
        let _ = processor.process(frame(0, vec![low, high], RawFrameCause::Ok));
        let reading = processor.process(frame(0, vec![5, 0], RawFrameCause::Ok));

        assert_eq!(reading.raw_value, 4_294_967_301);
        assert_eq!(reading.quality, Quality::Overflow);
    }

    #[test]
    fn counter_reset_is_uncertain_and_rebases_the_offset() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        processor.register_device(&device(vec![channel(0, DataType::UInt32LowHigh)]));

        let _ = processor.process(frame(0, vec![1000, 0], RawFrameCause::Ok));
        let reading = processor.process(frame(0, vec![500, 0], RawFrameCause::Ok));

        assert_eq!(reading.raw_value, 500);
        assert_eq!(reading.overflow_offset, 0);
        assert_eq!(reading.quality, Quality::Uncertain);
    }

    #[test]
    fn bad_frames_carry_forward_the_last_adjusted_value_with_no_rate() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        processor.register_device(&device(vec![channel(0, DataType::UInt16)]));

        let _ = processor.process(frame(0, vec![42], RawFrameCause::Ok));
        let reading = processor.process(frame(
            0,
            vec![0],
            RawFrameCause::Bad {
                reason: "timeout".to_string(),
            },
        ));

        assert_eq!(reading.raw_value, 42);
        assert_eq!(reading.rate_per_second, None);
        assert_eq!(reading.quality, Quality::Bad);
    }

    #[test]
    fn an_unregistered_channel_yields_a_configuration_error() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        let reading = processor.process(frame(9, vec![1], RawFrameCause::Ok));
        assert_eq!(reading.quality, Quality::ConfigurationError);
    }

    #[test]
    fn rate_is_populated_once_two_samples_span_a_second() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        processor.register_device(&device(vec![channel(0, DataType::UInt16)]));

        let mut first = frame(0, vec![100], RawFrameCause::Ok);
        let t0 = Instant::now();
        first.acquired_at.monotonic = t0;
        let _ = processor.process(first);

        let mut second = frame(0, vec![160], RawFrameCause::Ok);
        second.acquired_at.monotonic = t0 + Duration::from_secs(1);
        let reading = processor.process(second);

        assert_eq!(reading.rate_per_second, Some(60.0));
    }

    #[test]
    fn excessive_rate_degrades_quality_to_uncertain() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        let mut device_config = device(vec![channel(0, DataType::UInt16)]);
        device_config.channels[0].max_change_rate = Some(10.0);
        processor.register_device(&device_config);

        let mut first = frame(0, vec![100], RawFrameCause::Ok);
        let t0 = Instant::now();
        first.acquired_at.monotonic = t0;
        let _ = processor.process(first);

        let mut second = frame(0, vec![1000], RawFrameCause::Ok);
        second.acquired_at.monotonic = t0 + Duration::from_secs(1);
        let reading = processor.process(second);

        assert_eq!(reading.quality, Quality::Uncertain);
    }

    #[test]
    fn out_of_range_processed_value_is_bad() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        let mut device_config = device(vec![channel(0, DataType::UInt16)]);
        device_config.channels[0].max_value = 10.0;
        processor.register_device(&device_config);

        let reading = processor.process(frame(0, vec![42], RawFrameCause::Ok));
        assert_eq!(reading.quality, Quality::Bad);
    }

    #[test]
    fn unregister_device_drops_its_channels() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        processor.register_device(&device(vec![channel(0, DataType::UInt16)]));
        processor.unregister_device("line-1");

        let reading = processor.process(frame(0, vec![1], RawFrameCause::Ok));
        assert_eq!(reading.quality, Quality::ConfigurationError);
    }

    #[test]
    fn device_and_channel_tags_are_merged() {
        let mut processor = StreamProcessor::new(MetricsRegistry::new());
        let mut device_config = device(vec![channel(0, DataType::UInt16)]);
        let _ = device_config.tags.insert("site".to_string(), "plant-a".to_string());
        let _ = device_config.channels[0].tags.insert("unit".to_string(), "count".to_string());
        processor.register_device(&device_config);

        let reading = processor.process(frame(0, vec![1], RawFrameCause::Ok));
        assert_eq!(reading.tags.get("site"), Some(&"plant-a".to_string()));
        assert_eq!(reading.tags.get("unit"), Some(&"count".to_string()));
    }
}
