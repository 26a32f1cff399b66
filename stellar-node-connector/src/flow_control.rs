//! Credit-based flow control for flood traffic.
//!
//! After the handshake each side grants the other a reading capacity. Every
//! flood message the consumer finishes processing is counted, and once a
//! batch has been consumed the credit is returned to the peer with a
//! SEND_MORE (or SEND_MORE_EXTENDED in byte mode).

use stellar_xdr::curr::{MessageType, SendMore, SendMoreExtended, StellarMessage};

/// Lowest overlay version that understands byte-based flow control.
pub const FIRST_OVERLAY_VERSION_SUPPORTING_FLOW_CONTROL_IN_BYTES: u32 = 28;

/// AUTH flag requesting byte-based flow control.
pub const AUTH_MSG_FLAG_FLOW_CONTROL_BYTES_REQUESTED: i32 = 200;

/// Errors from an invalid flow-control configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("{batch} ({batch_size}) must not exceed {capacity} ({capacity_size})")]
    BatchExceedsCapacity {
        batch: &'static str,
        batch_size: u32,
        capacity: &'static str,
        capacity_size: u32,
    },
}

/// Flow-control sizes granted to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlConfig {
    pub peer_flood_reading_capacity: u32,
    pub flow_control_send_more_batch_size: u32,
    pub peer_flood_reading_capacity_bytes: u32,
    pub flow_control_send_more_batch_size_bytes: u32,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            peer_flood_reading_capacity: 200,
            flow_control_send_more_batch_size: 40,
            peer_flood_reading_capacity_bytes: 300_000,
            flow_control_send_more_batch_size_bytes: 100_000,
        }
    }
}

impl FlowControlConfig {
    pub fn validate(&self) -> Result<(), Error> {
        check_batch(
            "flow_control_send_more_batch_size",
            self.flow_control_send_more_batch_size,
            "peer_flood_reading_capacity",
            self.peer_flood_reading_capacity,
        )?;
        check_batch(
            "flow_control_send_more_batch_size_bytes",
            self.flow_control_send_more_batch_size_bytes,
            "peer_flood_reading_capacity_bytes",
            self.peer_flood_reading_capacity_bytes,
        )
    }
}

fn check_batch(
    batch: &'static str,
    batch_size: u32,
    capacity: &'static str,
    capacity_size: u32,
) -> Result<(), Error> {
    if batch_size == 0 {
        return Err(Error::Zero { name: batch });
    }
    if batch_size > capacity_size {
        return Err(Error::BatchExceedsCapacity {
            batch,
            batch_size,
            capacity,
            capacity_size,
        });
    }
    Ok(())
}

/// Messages that consume flow-control credit.
pub fn is_flood_message(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::Transaction
            | MessageType::ScpMessage
            | MessageType::FloodAdvert
            | MessageType::FloodDemand
    )
}

/// Per-connection credit accounting.
#[derive(Debug)]
pub struct FlowController {
    config: FlowControlConfig,
    bytes_enabled: bool,
    messages_received_in_current_batch: u32,
    bytes_received_in_current_batch: u64,
}

impl FlowController {
    /// Decide the flow-control mode and build the initial grant.
    pub fn start(
        config: FlowControlConfig,
        local_overlay_version: u32,
        remote_overlay_version: u32,
        remote_auth_flags: i32,
    ) -> (Self, StellarMessage) {
        let bytes_enabled = local_overlay_version
            >= FIRST_OVERLAY_VERSION_SUPPORTING_FLOW_CONTROL_IN_BYTES
            && remote_overlay_version >= FIRST_OVERLAY_VERSION_SUPPORTING_FLOW_CONTROL_IN_BYTES
            && remote_auth_flags == AUTH_MSG_FLAG_FLOW_CONTROL_BYTES_REQUESTED;

        let controller = Self {
            config,
            bytes_enabled,
            messages_received_in_current_batch: 0,
            bytes_received_in_current_batch: 0,
        };
        let grant = controller.grant(
            config.peer_flood_reading_capacity,
            config.peer_flood_reading_capacity_bytes,
        );
        (controller, grant)
    }

    pub fn bytes_enabled(&self) -> bool {
        self.bytes_enabled
    }

    /// Count a processed message of `size` XDR bytes.
    ///
    /// Returns the grant to send back once a batch has been consumed.
    pub fn on_message_received(
        &mut self,
        message_type: MessageType,
        size: usize,
    ) -> Option<StellarMessage> {
        if !is_flood_message(message_type) {
            return None;
        }

        self.messages_received_in_current_batch += 1;
        self.bytes_received_in_current_batch += size as u64;

        let batch_full = self.messages_received_in_current_batch
            >= self.config.flow_control_send_more_batch_size;
        let bytes_full = self.bytes_enabled
            && self.bytes_received_in_current_batch
                >= u64::from(self.config.flow_control_send_more_batch_size_bytes);
        if !batch_full && !bytes_full {
            return None;
        }

        let num_messages = self.messages_received_in_current_batch;
        let num_bytes = u32::try_from(self.bytes_received_in_current_batch).unwrap_or(u32::MAX);
        self.messages_received_in_current_batch = 0;
        self.bytes_received_in_current_batch = 0;
        Some(self.grant(num_messages, num_bytes))
    }

    fn grant(&self, num_messages: u32, num_bytes: u32) -> StellarMessage {
        if self.bytes_enabled {
            StellarMessage::SendMoreExtended(SendMoreExtended {
                num_messages,
                num_bytes,
            })
        } else {
            StellarMessage::SendMore(SendMore { num_messages })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_mode() -> FlowController {
        FlowController::start(FlowControlConfig::default(), 38, 38, 0).0
    }

    #[test]
    fn test_start_byte_mode() {
        let (controller, grant) = FlowController::start(
            FlowControlConfig::default(),
            38,
            35,
            AUTH_MSG_FLAG_FLOW_CONTROL_BYTES_REQUESTED,
        );
        assert!(controller.bytes_enabled());
        assert_eq!(
            grant,
            StellarMessage::SendMoreExtended(SendMoreExtended {
                num_messages: 200,
                num_bytes: 300_000,
            })
        );
    }

    #[test]
    fn test_start_count_mode() {
        let (controller, grant) = FlowController::start(FlowControlConfig::default(), 38, 38, 0);
        assert!(!controller.bytes_enabled());
        assert_eq!(grant, StellarMessage::SendMore(SendMore { num_messages: 200 }));

        let (old_peer, _) = FlowController::start(
            FlowControlConfig::default(),
            38,
            27,
            AUTH_MSG_FLAG_FLOW_CONTROL_BYTES_REQUESTED,
        );
        assert!(!old_peer.bytes_enabled());
    }

    #[test]
    fn test_grant_after_batch() {
        let mut controller = count_mode();
        for _ in 0..39 {
            assert_eq!(controller.on_message_received(MessageType::Transaction, 100), None);
        }
        assert_eq!(
            controller.on_message_received(MessageType::Transaction, 100),
            Some(StellarMessage::SendMore(SendMore { num_messages: 40 }))
        );
        assert_eq!(controller.on_message_received(MessageType::ScpMessage, 100), None);
    }

    #[test]
    fn test_non_flood_messages_are_free() {
        let mut controller = count_mode();
        for _ in 0..100 {
            assert_eq!(controller.on_message_received(MessageType::Peers, 100), None);
            assert_eq!(controller.on_message_received(MessageType::GetScpState, 8), None);
        }
    }

    #[test]
    fn test_byte_threshold() {
        let (mut controller, _) = FlowController::start(
            FlowControlConfig::default(),
            38,
            38,
            AUTH_MSG_FLAG_FLOW_CONTROL_BYTES_REQUESTED,
        );
        assert_eq!(controller.on_message_received(MessageType::FloodAdvert, 60_000), None);
        assert_eq!(
            controller.on_message_received(MessageType::FloodDemand, 50_000),
            Some(StellarMessage::SendMoreExtended(SendMoreExtended {
                num_messages: 2,
                num_bytes: 110_000,
            }))
        );
        assert_eq!(controller.on_message_received(MessageType::FloodAdvert, 10), None);
    }

    #[test]
    fn test_validate() {
        assert!(FlowControlConfig::default().validate().is_ok());

        let zero = FlowControlConfig {
            flow_control_send_more_batch_size: 0,
            ..FlowControlConfig::default()
        };
        assert_eq!(
            zero.validate(),
            Err(Error::Zero {
                name: "flow_control_send_more_batch_size"
            })
        );

        let oversize = FlowControlConfig {
            flow_control_send_more_batch_size_bytes: 400_000,
            ..FlowControlConfig::default()
        };
        assert!(matches!(
            oversize.validate(),
            Err(Error::BatchExceedsCapacity { .. })
        ));
    }
}
