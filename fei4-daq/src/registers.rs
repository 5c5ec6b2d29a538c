//! Address map of the readout board FPGA and the command
//! opcodes of the front-end protocol.
//!
//! Registers are accessed through the control address space
//! (see `bus.rs`). Each register is one 32bit word; only the
//! documented bits are meaningful.

//========== command sequencer ==========
//
// The command memory holds the serialized bit stream sent
// to the chip. 16 bytes at the top are register space, the
// rest is command payload.
//=======================================

pub const CMD_BASE        : u32 = 0x0000;
/// [15:0] length of the prepared command in bits
pub const CMD_SIZE        : u32 = CMD_BASE + 0x04;
/// [15:0] hardware repeat count for the prepared command
pub const CMD_REPEAT      : u32 = CMD_BASE + 0x08;
/// Write 1 to start streaming the command memory
pub const CMD_START       : u32 = CMD_BASE + 0x0c;
/// [0] command sequencer idle/ready
pub const CMD_READY       : u32 = CMD_BASE + 0x10;
/// Byte offset of the command payload within the memory window
pub const CMD_MEM_OFFSET  : u32 = 0x10;
/// Total command memory in bytes, 16 bytes register space included
pub const CMD_MEM_SIZE    : usize = 2048;

//========== receive FIFO ===============
//=======================================

pub const FIFO_BASE       : u32 = 0x8100;
/// Write any value to reset the FIFO
pub const FIFO_RESET      : u32 = FIFO_BASE;
/// [23:0] FIFO occupancy in 16bit units
pub const FIFO_SIZE       : u32 = FIFO_BASE + 0x04;
/// Read port, pops one 32bit word per read
pub const FIFO_DATA       : u32 = FIFO_BASE + 0x08;

//========== RX channels ================
//
// One register block per RX channel, 4 channels.
//=======================================

pub const RX_BASE         : [u32; 4] = [0x8600, 0x8500, 0x8400, 0x8300];
/// Write any value to reset the channel counters
pub const RX_RESET_OFF    : u32 = 0x01;
/// [0] channel is synchronized
pub const RX_SYNC_OFF     : u32 = 0x02;
/// [7:0] 8b10b decoder error count
pub const RX_8B10B_ERR_OFF : u32 = 0x05;
/// [7:0] FIFO discard count
pub const RX_DISCARD_OFF  : u32 = 0x06;

//========== trigger / TDC FSM ==========
//=======================================

pub const TRG_BASE        : u32 = 0x8200;
/// [1:0] trigger mode, see ScanConfig::trigger_mode
pub const TRG_MODE        : u32 = TRG_BASE + 0x04;
/// [0] replay the command memory on an external trigger
pub const TRG_EXT_ENABLE  : u32 = TRG_BASE + 0x08;
/// [31:0] trigger counter
pub const TRG_COUNTER     : u32 = TRG_BASE + 0x0c;
/// Write 1 to reset the trigger counter
pub const TRG_COUNTER_RST : u32 = TRG_BASE + 0x10;
/// [0] enable the hit-or TDC
pub const TDC_ENABLE      : u32 = TRG_BASE + 0x14;

//========== FE-I4 command opcodes ======
//
// Every command starts with the 5 bit header (trigger
// excepted). Slow commands continue with field1 = 1000,
// a 4 bit field2 and the 4 bit chip address.
//=======================================

pub const CMD_HEADER        : u64 = 0b10110;
pub const CMD_HEADER_BITS   : usize = 5;
/// trigger is the single exception without header
pub const CMD_LV1           : u64 = 0b11101;
pub const CMD_LV1_BITS      : usize = 5;

pub const FIELD1_BCR        : u64 = 0b0001;
pub const FIELD1_ECR        : u64 = 0b0010;
pub const FIELD1_CAL        : u64 = 0b0100;
pub const FIELD1_SLOW       : u64 = 0b1000;
pub const FIELD1_BITS       : usize = 4;

pub const FIELD2_RD_REGISTER  : u64 = 0b0001;
pub const FIELD2_WR_REGISTER  : u64 = 0b0010;
pub const FIELD2_WR_FRONTEND  : u64 = 0b0100;
pub const FIELD2_GLOBAL_RESET : u64 = 0b1000;
pub const FIELD2_GLOBAL_PULSE : u64 = 0b1001;
pub const FIELD2_RUN_MODE     : u64 = 0b1010;
pub const FIELD2_BITS         : usize = 4;

pub const CHIP_ADDRESS_BITS   : usize = 4;
/// chip address bit 3 addresses every chip on the bus
pub const CHIP_ADDRESS_BROADCAST : u8 = 0b1000;

pub const REG_ADDRESS_BITS    : usize = 6;
pub const REG_DATA_BITS       : usize = 16;
pub const PULSE_WIDTH_BITS    : usize = 6;

pub const RUNMODE_RUN         : u64 = 0b111000;
pub const RUNMODE_CONF        : u64 = 0b000111;
pub const RUNMODE_BITS        : usize = 6;
