pub const TOPIC_LINK_REQUEST: &str = "thermostat/profile/request";
pub const TOPIC_LINK_NOTIFY: &str = "thermostat/profile/notify";
pub const TOPIC_LINK_PRESENCE: &str = "thermostat/profile/presence";

pub const PRESENCE_ONLINE: &str = "online";
pub const PRESENCE_OFFLINE: &str = "offline";
