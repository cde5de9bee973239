// DALI command opcodes (IEC 62386-102) used by the bridge.
// Commands are sent with the address byte's command bit set; a brightness
// write (DAPC) is the bare level byte instead of an opcode.

pub const DALI_QUERY_CONTROL_GEAR_PRESENT: u16 = 0x0091;
pub const DALI_QUERY_PHYSICAL_MINIMUM: u16 = 0x009a;
pub const DALI_QUERY_ACTUAL_LEVEL: u16 = 0x00a0;
pub const DALI_QUERY_MAX_LEVEL: u16 = 0x00a1;
pub const DALI_QUERY_MIN_LEVEL: u16 = 0x00a2;
pub const DALI_QUERY_GROUPS_0_7: u16 = 0x00c0;
pub const DALI_QUERY_GROUPS_8_15: u16 = 0x00c1;
