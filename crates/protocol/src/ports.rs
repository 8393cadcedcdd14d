//! Well-known control-plane ports

/// Controller session (subscribe / unsubscribe)
pub const SUBSCRIBE_PORT: u16 = 10000;
/// Start an asset
pub const START_ASSET_PORT: u16 = 10001;
/// Stop an asset
pub const STOP_ASSET_PORT: u16 = 10002;
/// Asset catalog publisher, bound only for the duration of one publish
pub const ASSET_STATE_PORT: u16 = 10003;
/// Device identity
pub const GET_IDENTITY_PORT: u16 = 10004;
/// Device signal RPC
pub const SIGNAL_RPC_PORT: u16 = 10005;
/// Wifi connection requests
pub const CONNECT_WIFI_PORT: u16 = 10006;
