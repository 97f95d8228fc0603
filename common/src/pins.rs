pub const PIN_HEARTBEAT: &str = "V0";
pub const PIN_FLOW_RATE: &str = "V1";
pub const PIN_TOTAL_VOLUME: &str = "V2";
pub const PIN_RELAY: &str = "V3";

pub const DEFAULT_MONITORED_PINS: [&str; 4] =
    [PIN_HEARTBEAT, PIN_FLOW_RATE, PIN_TOTAL_VOLUME, PIN_RELAY];
