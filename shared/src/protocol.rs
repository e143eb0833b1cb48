/// mDNS service type the broadcaster advertises and the receiver browses
pub const SERVICE_TYPE: &str = "_loop._tcp.local.";

/// Advertised instance names look like `Loop-<id>`
pub const SERVICE_NAME_PREFIX: &str = "Loop";

/// Version reported by `/info`
pub const PROTOCOL_VERSION: u32 = 1;

/// Number of characters in a broadcaster id
pub const ID_LEN: usize = 4;

/// HTTP paths served by the broadcaster
pub const INFO_PATH: &str = "/info";
pub const PING_PATH: &str = "/ping";
pub const COMMAND_PATH: &str = "/command";

/// The only command type the broadcaster accepts
pub const COMMAND_VOLUME: &str = "volume";

/// Builds the advertised instance name for a broadcaster id.
pub fn service_name(prefix: &str, id: &str) -> String {
    format!("{}-{}", prefix, id)
}
