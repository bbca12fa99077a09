use config::ChannelConfig;

/// Maximum register span of a single Modbus/TCP read, per the function
/// code 0x03 request format.
pub const MAX_REGISTER_SPAN: u16 = 125;

/// One channel's position within a [`ChannelGroup`]'s combined read.
#[derive(Debug, Clone)]
pub struct ChannelSlice {
    /// The channel this slice belongs to.
    pub channel_number: u16,
    /// Offset, in registers, from the group's `start_register`.
    pub offset: u16,
    /// Number of registers this channel occupies.
    pub register_count: u8,
}

/// A set of channels whose address ranges are contiguous and fit in one
/// Modbus read.
#[derive(Debug, Clone)]
pub struct ChannelGroup {
    /// Start address of the combined read.
    pub start_register: u16,
    /// Total registers spanned by the group.
    pub register_span: u16,
    /// Channels carried by this group, in address order.
    pub members: Vec<ChannelSlice>,
}

/// Groups a device's enabled channels into the fewest reads that keep
/// each read's span within [`MAX_REGISTER_SPAN`], merging channels whose
/// register ranges are back-to-back.
pub fn group_channels(channels: &[ChannelConfig]) -> Vec<ChannelGroup> {
    let mut enabled: Vec<&ChannelConfig> = channels.iter().filter(|channel| channel.enabled).collect();
    enabled.sort_by_key(|channel| channel.start_register);

    let mut groups: Vec<ChannelGroup> = Vec::new();

    for channel in enabled {
        let width = u16::from(channel.register_count);

        if let Some(group) = groups.last_mut() {
            let next_address = group.start_register + group.register_span;
            let candidate_span = group.register_span + width;

            if channel.start_register == next_address && candidate_span <= MAX_REGISTER_SPAN {
                group.members.push(ChannelSlice {
                    channel_number: channel.channel_number,
                    offset: group.register_span,
                    register_count: channel.register_count,
                });
                group.register_span = candidate_span;
                continue;
            }
        }

        groups.push(ChannelGroup {
            start_register: channel.start_register,
            register_span: width,
            members: vec![ChannelSlice {
                channel_number: channel.channel_number,
                offset: 0,
                register_count: channel.register_count,
            }],
        });
    }

    groups
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use config::DataType;

    use super::*;

    fn channel(channel_number: u16, start_register: u16, register_count: u8) -> ChannelConfig {
        ChannelConfig {
            channel_number,
            name: format!("ch{channel_number}"),
            start_register,
            register_count,
            data_type: if register_count == 1 {
                DataType::UInt16
            } else {
                DataType::UInt32LowHigh
            },
            scale_factor: 1.0,
            offset: 0.0,
            decimal_places: 0,
            min_value: 0.0,
            max_value: 1_000_000.0,
            max_change_rate: None,
            enabled: true,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn contiguous_channels_merge_into_one_group() {
        let channels = vec![channel(0, 100, 2), channel(1, 102, 1), channel(2, 103, 2)];
        let groups = group_channels(&channels);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].start_register, 100);
        assert_eq!(groups[0].register_span, 5);
        assert_eq!(groups[0].members.len(), 3);
        assert_eq!(groups[0].members[1].offset, 2);
        assert_eq!(groups[0].members[2].offset, 3);
    }

    #[test]
    fn a_gap_splits_into_separate_groups() {
        let channels = vec![channel(0, 100, 1), channel(1, 150, 1)];
        let groups = group_channels(&channels);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn disabled_channels_are_excluded() {
        let mut disabled = channel(1, 101, 1);
        disabled.enabled = false;
        let channels = vec![channel(0, 100, 1), disabled];
        let groups = group_channels(&channels);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 1);
    }

    #[test]
    fn span_exceeding_the_maximum_starts_a_new_group() {
        let mut channels = Vec::new();
        let mut register = 0u16;
        for i in 0..130 {
            channels.push(channel(i, register, 1));
            register += 1;
        }

        let groups = group_channels(&channels);
        assert!(groups.len() >= 2);
        assert!(groups.iter().all(|g| g.register_span <= MAX_REGISTER_SPAN));
    }
}
