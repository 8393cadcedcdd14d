//! Protocol library for hermes
//!
//! This crate defines the messages exchanged between the device service and a
//! remote controller: asset types, control-plane requests and replies,
//! data-plane records, the well-known control ports and the line codec.
//!
//! # Example
//!
//! ```
//! use protocol::{AssetType, StartAssetRequest, decode_line, encode_line};
//!
//! let req: StartAssetRequest =
//!     decode_line(r#"{"id":"in72e","type":"imu","config":{"fps":30}}"#).unwrap();
//! assert_eq!(req.asset_type, AssetType::Imu);
//!
//! let line = encode_line(&req).unwrap();
//! assert!(!line.contains('\n'));
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod ports;
pub mod records;
pub mod types;

pub use codec::{
    MAX_FRAME_SIZE, decode_line, encode_line, frame_overflowed, frame_to_string, read_frame,
    read_line, write_line,
};
pub use error::{ProtocolError, Result};
pub use messages::{
    CONFIG_IP, CONFIG_PORT_PUB, CONFIG_PORT_SUB, ConnectWifiRequest, Identity, IdentityResponse,
    SignalRequest, StandardResponse, StartAssetRequest, StopAssetRequest, SubscribeRequest,
};
pub use records::{FrameRecord, ImuRecord, RawRecord};
pub use types::{AssetState, AssetType};
