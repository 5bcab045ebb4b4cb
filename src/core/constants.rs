use std::time::Duration;
use uuid::Uuid;

/// All Bluetooth SIG UUIDs share this base; only the short code varies.
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expands a 16-bit Bluetooth short code to a full 128-bit UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// The short code of a UUID, if it is built on the Bluetooth base UUID.
pub fn uuid_to_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !(0xffff_u128 << 96) == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// UUID of the Inkbird temperature GATT service.
pub const TEMPERATURE_SERVICE_UUID: Uuid = uuid_from_u16(0xff00);
/// UUID of the temperature notify characteristic.
pub const TEMPERATURE_NOTIFY_UUID: Uuid = uuid_from_u16(0xff01);
/// UUID of the command write characteristic.
pub const COMMAND_WRITE_UUID: Uuid = uuid_from_u16(0xff02);
/// UUID of the standard battery level characteristic.
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2a19);
/// The one vendor characteristic that is never subscribed.
pub const IGNORED_AUX_UUID: Uuid = uuid_from_u16(0xff05);

/// Advertised names the thermometer shows up under.
pub const TARGET_DEVICE_NAMES: [&str; 2] = ["IDT-34c-B", "INKBIRD"];

/// Readings at or above this are sensor sentinels, not temperatures.
pub const MAXTEMP: f64 = 1802.5;
/// Log cycles before an unchanged reading stops counting as redundant.
pub const MAXWAIT: u32 = 20;
/// Period of the bus reconciliation sweep.
pub const WATCHTIME: Duration = Duration::from_secs(45);
/// Period of the logger tick.
pub const LOG_INTERVAL: Duration = Duration::from_secs(1);

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
pub const MAX_BACKOFF: Duration = Duration::from_secs(16);

/// Channels per device slot.
pub const SLOT_WIDTH: usize = 4;
/// Concurrently supervised devices.
pub const SLOT_COUNT: usize = 6;
/// Total channels in the sample register.
pub const CHANNELS: usize = SLOT_WIDTH * SLOT_COUNT;

/// A freshly resolved temperature service is expected to yield at least
/// this many subscribable characteristics; fewer means BlueZ handed us a
/// partial enumeration.
pub const MIN_BINDINGS: usize = 6;

/// Kickoff write that makes the thermometer start streaming
/// ("pseudo-pairing", not Bluetooth pairing in the security sense).
pub const PSEUDO_PAIR_COMMAND: [u8; 7] = [0xfd, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Initialization burst written to the command characteristic after the
/// kickoff, in order. Captured from the vendor app; the replies are never
/// parsed.
pub const INIT_SEQUENCE: [&[u8]; 18] = [
    &[0x02, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x02, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x02, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x02, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x08],
    &[0x0a, 0x0f, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x0c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x13, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x18],
    &[0x24],
    &[0x26, 0x01],
    &[0x26, 0x02],
    &[0x26, 0x04],
    &[0x26, 0x08],
];
