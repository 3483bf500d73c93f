//! Instruction opcodes and their text-format names.
//!
//! Single-byte opcodes are `u8` constants. Instructions behind the `0xfc`
//! (miscellaneous) and `0xfd` (vector) prefixes are identified by the
//! LEB128-encoded `u32` that follows the prefix.

pub const UNREACHABLE: u8 = 0x00;
pub const NOP: u8 = 0x01;
pub const BLOCK: u8 = 0x02;
pub const LOOP: u8 = 0x03;
pub const IF: u8 = 0x04;
pub const ELSE: u8 = 0x05;
pub const END: u8 = 0x0b;
pub const BR: u8 = 0x0c;
pub const BR_IF: u8 = 0x0d;
pub const BR_TABLE: u8 = 0x0e;
pub const RETURN: u8 = 0x0f;
pub const CALL: u8 = 0x10;
pub const CALL_INDIRECT: u8 = 0x11;

pub const DROP: u8 = 0x1a;
pub const SELECT: u8 = 0x1b;
pub const TYPED_SELECT: u8 = 0x1c;

pub const LOCAL_GET: u8 = 0x20;
pub const LOCAL_SET: u8 = 0x21;
pub const LOCAL_TEE: u8 = 0x22;
pub const GLOBAL_GET: u8 = 0x23;
pub const GLOBAL_SET: u8 = 0x24;
pub const TABLE_GET: u8 = 0x25;
pub const TABLE_SET: u8 = 0x26;

pub const I32_LOAD: u8 = 0x28;
pub const I64_LOAD: u8 = 0x29;
pub const F32_LOAD: u8 = 0x2a;
pub const F64_LOAD: u8 = 0x2b;
pub const I32_LOAD8_S: u8 = 0x2c;
pub const I32_LOAD8_U: u8 = 0x2d;
pub const I32_LOAD16_S: u8 = 0x2e;
pub const I32_LOAD16_U: u8 = 0x2f;
pub const I64_LOAD8_S: u8 = 0x30;
pub const I64_LOAD8_U: u8 = 0x31;
pub const I64_LOAD16_S: u8 = 0x32;
pub const I64_LOAD16_U: u8 = 0x33;
pub const I64_LOAD32_S: u8 = 0x34;
pub const I64_LOAD32_U: u8 = 0x35;
pub const I32_STORE: u8 = 0x36;
pub const I64_STORE: u8 = 0x37;
pub const F32_STORE: u8 = 0x38;
pub const F64_STORE: u8 = 0x39;
pub const I32_STORE8: u8 = 0x3a;
pub const I32_STORE16: u8 = 0x3b;
pub const I64_STORE8: u8 = 0x3c;
pub const I64_STORE16: u8 = 0x3d;
pub const I64_STORE32: u8 = 0x3e;
pub const MEMORY_SIZE: u8 = 0x3f;
pub const MEMORY_GROW: u8 = 0x40;

pub const I32_CONST: u8 = 0x41;
pub const I64_CONST: u8 = 0x42;
pub const F32_CONST: u8 = 0x43;
pub const F64_CONST: u8 = 0x44;

pub const I32_EQZ: u8 = 0x45;
pub const I32_EQ: u8 = 0x46;
pub const I32_NE: u8 = 0x47;
pub const I32_LT_S: u8 = 0x48;
pub const I32_ADD: u8 = 0x6a;
pub const I32_SUB: u8 = 0x6b;
pub const I32_MUL: u8 = 0x6c;
pub const I64_ADD: u8 = 0x7c;
pub const I32_WRAP_I64: u8 = 0xa7;
pub const I32_EXTEND8_S: u8 = 0xc0;
pub const I64_EXTEND32_S: u8 = 0xc4;

pub const REF_NULL: u8 = 0xd0;
pub const REF_IS_NULL: u8 = 0xd1;
pub const REF_FUNC: u8 = 0xd2;

pub const MISC_PREFIX: u8 = 0xfc;
pub const VEC_PREFIX: u8 = 0xfd;

/// Sub-opcodes of the `0xfc` prefix.
pub mod misc {
    pub const I32_TRUNC_SAT_F32_S: u32 = 0x00;
    pub const I32_TRUNC_SAT_F32_U: u32 = 0x01;
    pub const I32_TRUNC_SAT_F64_S: u32 = 0x02;
    pub const I32_TRUNC_SAT_F64_U: u32 = 0x03;
    pub const I64_TRUNC_SAT_F32_S: u32 = 0x04;
    pub const I64_TRUNC_SAT_F32_U: u32 = 0x05;
    pub const I64_TRUNC_SAT_F64_S: u32 = 0x06;
    pub const I64_TRUNC_SAT_F64_U: u32 = 0x07;
    pub const MEMORY_INIT: u32 = 0x08;
    pub const DATA_DROP: u32 = 0x09;
    pub const MEMORY_COPY: u32 = 0x0a;
    pub const MEMORY_FILL: u32 = 0x0b;
    pub const TABLE_INIT: u32 = 0x0c;
    pub const ELEM_DROP: u32 = 0x0d;
    pub const TABLE_COPY: u32 = 0x0e;
    pub const TABLE_GROW: u32 = 0x0f;
    pub const TABLE_SIZE: u32 = 0x10;
    pub const TABLE_FILL: u32 = 0x11;
}

/// Sub-opcodes of the `0xfd` prefix that need special handling during
/// validation. The remaining vector instructions are classified by
/// signature in the validator.
pub mod vec {
    pub const V128_LOAD: u32 = 0x00;
    pub const V128_LOAD8X8_S: u32 = 0x01;
    pub const V128_LOAD32X2_U: u32 = 0x06;
    pub const V128_LOAD8_SPLAT: u32 = 0x07;
    pub const V128_LOAD16_SPLAT: u32 = 0x08;
    pub const V128_LOAD32_SPLAT: u32 = 0x09;
    pub const V128_LOAD64_SPLAT: u32 = 0x0a;
    pub const V128_STORE: u32 = 0x0b;
    pub const V128_CONST: u32 = 0x0c;
    pub const I8X16_SHUFFLE: u32 = 0x0d;
    pub const I8X16_SWIZZLE: u32 = 0x0e;
    pub const I8X16_SPLAT: u32 = 0x0f;
    pub const F64X2_SPLAT: u32 = 0x14;
    pub const I8X16_EXTRACT_LANE_S: u32 = 0x15;
    pub const F64X2_REPLACE_LANE: u32 = 0x22;
    pub const V128_LOAD8_LANE: u32 = 0x54;
    pub const V128_LOAD64_LANE: u32 = 0x57;
    pub const V128_STORE8_LANE: u32 = 0x58;
    pub const V128_STORE64_LANE: u32 = 0x5b;
    pub const V128_LOAD32_ZERO: u32 = 0x5c;
    pub const V128_LOAD64_ZERO: u32 = 0x5d;
}

/// Returns the text-format name of a single-byte instruction.
pub fn instruction_name(op: u8) -> &'static str {
    match op {
        0x00 => "unreachable",
        0x01 => "nop",
        0x02 => "block",
        0x03 => "loop",
        0x04 => "if",
        0x05 => "else",
        0x0b => "end",
        0x0c => "br",
        0x0d => "br_if",
        0x0e => "br_table",
        0x0f => "return",
        0x10 => "call",
        0x11 => "call_indirect",
        0x1a => "drop",
        0x1b => "select",
        0x1c => "typed_select",
        0x20 => "local.get",
        0x21 => "local.set",
        0x22 => "local.tee",
        0x23 => "global.get",
        0x24 => "global.set",
        0x25 => "table.get",
        0x26 => "table.set",
        0x28 => "i32.load",
        0x29 => "i64.load",
        0x2a => "f32.load",
        0x2b => "f64.load",
        0x2c => "i32.load8_s",
        0x2d => "i32.load8_u",
        0x2e => "i32.load16_s",
        0x2f => "i32.load16_u",
        0x30 => "i64.load8_s",
        0x31 => "i64.load8_u",
        0x32 => "i64.load16_s",
        0x33 => "i64.load16_u",
        0x34 => "i64.load32_s",
        0x35 => "i64.load32_u",
        0x36 => "i32.store",
        0x37 => "i64.store",
        0x38 => "f32.store",
        0x39 => "f64.store",
        0x3a => "i32.store8",
        0x3b => "i32.store16",
        0x3c => "i64.store8",
        0x3d => "i64.store16",
        0x3e => "i64.store32",
        0x3f => "memory.size",
        0x40 => "memory.grow",
        0x41 => "i32.const",
        0x42 => "i64.const",
        0x43 => "f32.const",
        0x44 => "f64.const",
        0x45 => "i32.eqz",
        0x46 => "i32.eq",
        0x47 => "i32.ne",
        0x48 => "i32.lt_s",
        0x49 => "i32.lt_u",
        0x4a => "i32.gt_s",
        0x4b => "i32.gt_u",
        0x4c => "i32.le_s",
        0x4d => "i32.le_u",
        0x4e => "i32.ge_s",
        0x4f => "i32.ge_u",
        0x50 => "i64.eqz",
        0x51 => "i64.eq",
        0x52 => "i64.ne",
        0x53 => "i64.lt_s",
        0x54 => "i64.lt_u",
        0x55 => "i64.gt_s",
        0x56 => "i64.gt_u",
        0x57 => "i64.le_s",
        0x58 => "i64.le_u",
        0x59 => "i64.ge_s",
        0x5a => "i64.ge_u",
        0x5b => "f32.eq",
        0x5c => "f32.ne",
        0x5d => "f32.lt",
        0x5e => "f32.gt",
        0x5f => "f32.le",
        0x60 => "f32.ge",
        0x61 => "f64.eq",
        0x62 => "f64.ne",
        0x63 => "f64.lt",
        0x64 => "f64.gt",
        0x65 => "f64.le",
        0x66 => "f64.ge",
        0x67 => "i32.clz",
        0x68 => "i32.ctz",
        0x69 => "i32.popcnt",
        0x6a => "i32.add",
        0x6b => "i32.sub",
        0x6c => "i32.mul",
        0x6d => "i32.div_s",
        0x6e => "i32.div_u",
        0x6f => "i32.rem_s",
        0x70 => "i32.rem_u",
        0x71 => "i32.and",
        0x72 => "i32.or",
        0x73 => "i32.xor",
        0x74 => "i32.shl",
        0x75 => "i32.shr_s",
        0x76 => "i32.shr_u",
        0x77 => "i32.rotl",
        0x78 => "i32.rotr",
        0x79 => "i64.clz",
        0x7a => "i64.ctz",
        0x7b => "i64.popcnt",
        0x7c => "i64.add",
        0x7d => "i64.sub",
        0x7e => "i64.mul",
        0x7f => "i64.div_s",
        0x80 => "i64.div_u",
        0x81 => "i64.rem_s",
        0x82 => "i64.rem_u",
        0x83 => "i64.and",
        0x84 => "i64.or",
        0x85 => "i64.xor",
        0x86 => "i64.shl",
        0x87 => "i64.shr_s",
        0x88 => "i64.shr_u",
        0x89 => "i64.rotl",
        0x8a => "i64.rotr",
        0x8b => "f32.abs",
        0x8c => "f32.neg",
        0x8d => "f32.ceil",
        0x8e => "f32.floor",
        0x8f => "f32.trunc",
        0x90 => "f32.nearest",
        0x91 => "f32.sqrt",
        0x92 => "f32.add",
        0x93 => "f32.sub",
        0x94 => "f32.mul",
        0x95 => "f32.div",
        0x96 => "f32.min",
        0x97 => "f32.max",
        0x98 => "f32.copysign",
        0x99 => "f64.abs",
        0x9a => "f64.neg",
        0x9b => "f64.ceil",
        0x9c => "f64.floor",
        0x9d => "f64.trunc",
        0x9e => "f64.nearest",
        0x9f => "f64.sqrt",
        0xa0 => "f64.add",
        0xa1 => "f64.sub",
        0xa2 => "f64.mul",
        0xa3 => "f64.div",
        0xa4 => "f64.min",
        0xa5 => "f64.max",
        0xa6 => "f64.copysign",
        0xa7 => "i32.wrap_i64",
        0xa8 => "i32.trunc_f32_s",
        0xa9 => "i32.trunc_f32_u",
        0xaa => "i32.trunc_f64_s",
        0xab => "i32.trunc_f64_u",
        0xac => "i64.extend_i32_s",
        0xad => "i64.extend_i32_u",
        0xae => "i64.trunc_f32_s",
        0xaf => "i64.trunc_f32_u",
        0xb0 => "i64.trunc_f64_s",
        0xb1 => "i64.trunc_f64_u",
        0xb2 => "f32.convert_i32_s",
        0xb3 => "f32.convert_i32_u",
        0xb4 => "f32.convert_i64_s",
        0xb5 => "f32.convert_i64_u",
        0xb6 => "f32.demote_f64",
        0xb7 => "f64.convert_i32_s",
        0xb8 => "f64.convert_i32_u",
        0xb9 => "f64.convert_i64_s",
        0xba => "f64.convert_i64_u",
        0xbb => "f64.promote_f32",
        0xbc => "i32.reinterpret_f32",
        0xbd => "i64.reinterpret_f64",
        0xbe => "f32.reinterpret_i32",
        0xbf => "f64.reinterpret_i64",
        0xc0 => "i32.extend8_s",
        0xc1 => "i32.extend16_s",
        0xc2 => "i64.extend8_s",
        0xc3 => "i64.extend16_s",
        0xc4 => "i64.extend32_s",
        0xd0 => "ref.null",
        0xd1 => "ref.is_null",
        0xd2 => "ref.func",
        0xfc => "misc_prefix",
        0xfd => "vec_prefix",
        _ => "unknown",
    }
}

/// Returns the text-format name of a `0xfc` prefixed instruction.
pub fn misc_instruction_name(op: u32) -> &'static str {
    match op {
        0x00 => "i32.trunc_sat_f32_s",
        0x01 => "i32.trunc_sat_f32_u",
        0x02 => "i32.trunc_sat_f64_s",
        0x03 => "i32.trunc_sat_f64_u",
        0x04 => "i64.trunc_sat_f32_s",
        0x05 => "i64.trunc_sat_f32_u",
        0x06 => "i64.trunc_sat_f64_s",
        0x07 => "i64.trunc_sat_f64_u",
        0x08 => "memory.init",
        0x09 => "data.drop",
        0x0a => "memory.copy",
        0x0b => "memory.fill",
        0x0c => "table.init",
        0x0d => "elem.drop",
        0x0e => "table.copy",
        0x0f => "table.grow",
        0x10 => "table.size",
        0x11 => "table.fill",
        _ => "unknown",
    }
}

/// Returns the text-format name of a `0xfd` prefixed instruction.
pub fn vector_instruction_name(op: u32) -> &'static str {
    match op {
        0x00 => "v128.load",
        0x01 => "v128.load8x8_s",
        0x02 => "v128.load8x8_u",
        0x03 => "v128.load16x4_s",
        0x04 => "v128.load16x4_u",
        0x05 => "v128.load32x2_s",
        0x06 => "v128.load32x2_u",
        0x07 => "v128.load8_splat",
        0x08 => "v128.load16_splat",
        0x09 => "v128.load32_splat",
        0x0a => "v128.load64_splat",
        0x0b => "v128.store",
        0x0c => "v128.const",
        0x0d => "i8x16.shuffle",
        0x0e => "i8x16.swizzle",
        0x0f => "i8x16.splat",
        0x10 => "i16x8.splat",
        0x11 => "i32x4.splat",
        0x12 => "i64x2.splat",
        0x13 => "f32x4.splat",
        0x14 => "f64x2.splat",
        0x15 => "i8x16.extract_lane_s",
        0x16 => "i8x16.extract_lane_u",
        0x17 => "i8x16.replace_lane",
        0x18 => "i16x8.extract_lane_s",
        0x19 => "i16x8.extract_lane_u",
        0x1a => "i16x8.replace_lane",
        0x1b => "i32x4.extract_lane",
        0x1c => "i32x4.replace_lane",
        0x1d => "i64x2.extract_lane",
        0x1e => "i64x2.replace_lane",
        0x1f => "f32x4.extract_lane",
        0x20 => "f32x4.replace_lane",
        0x21 => "f64x2.extract_lane",
        0x22 => "f64x2.replace_lane",
        0x23 => "i8x16.eq",
        0x24 => "i8x16.ne",
        0x25 => "i8x16.lt_s",
        0x26 => "i8x16.lt_u",
        0x27 => "i8x16.gt_s",
        0x28 => "i8x16.gt_u",
        0x29 => "i8x16.le_s",
        0x2a => "i8x16.le_u",
        0x2b => "i8x16.ge_s",
        0x2c => "i8x16.ge_u",
        0x2d => "i16x8.eq",
        0x2e => "i16x8.ne",
        0x2f => "i16x8.lt_s",
        0x30 => "i16x8.lt_u",
        0x31 => "i16x8.gt_s",
        0x32 => "i16x8.gt_u",
        0x33 => "i16x8.le_s",
        0x34 => "i16x8.le_u",
        0x35 => "i16x8.ge_s",
        0x36 => "i16x8.ge_u",
        0x37 => "i32x4.eq",
        0x38 => "i32x4.ne",
        0x39 => "i32x4.lt_s",
        0x3a => "i32x4.lt_u",
        0x3b => "i32x4.gt_s",
        0x3c => "i32x4.gt_u",
        0x3d => "i32x4.le_s",
        0x3e => "i32x4.le_u",
        0x3f => "i32x4.ge_s",
        0x40 => "i32x4.ge_u",
        0x41 => "f32x4.eq",
        0x42 => "f32x4.ne",
        0x43 => "f32x4.lt",
        0x44 => "f32x4.gt",
        0x45 => "f32x4.le",
        0x46 => "f32x4.ge",
        0x47 => "f64x2.eq",
        0x48 => "f64x2.ne",
        0x49 => "f64x2.lt",
        0x4a => "f64x2.gt",
        0x4b => "f64x2.le",
        0x4c => "f64x2.ge",
        0x4d => "v128.not",
        0x4e => "v128.and",
        0x4f => "v128.andnot",
        0x50 => "v128.or",
        0x51 => "v128.xor",
        0x52 => "v128.bitselect",
        0x53 => "v128.any_true",
        0x54 => "v128.load8_lane",
        0x55 => "v128.load16_lane",
        0x56 => "v128.load32_lane",
        0x57 => "v128.load64_lane",
        0x58 => "v128.store8_lane",
        0x59 => "v128.store16_lane",
        0x5a => "v128.store32_lane",
        0x5b => "v128.store64_lane",
        0x5c => "v128.load32_zero",
        0x5d => "v128.load64_zero",
        0x5e => "f32x4.demote_f64x2_zero",
        0x5f => "f64x2.promote_low_f32x4",
        0x60 => "i8x16.abs",
        0x61 => "i8x16.neg",
        0x62 => "i8x16.popcnt",
        0x63 => "i8x16.all_true",
        0x64 => "i8x16.bitmask",
        0x65 => "i8x16.narrow_i16x8_s",
        0x66 => "i8x16.narrow_i16x8_u",
        0x67 => "f32x4.ceil",
        0x68 => "f32x4.floor",
        0x69 => "f32x4.trunc",
        0x6a => "f32x4.nearest",
        0x6b => "i8x16.shl",
        0x6c => "i8x16.shr_s",
        0x6d => "i8x16.shr_u",
        0x6e => "i8x16.add",
        0x6f => "i8x16.add_sat_s",
        0x70 => "i8x16.add_sat_u",
        0x71 => "i8x16.sub",
        0x72 => "i8x16.sub_sat_s",
        0x73 => "i8x16.sub_sat_u",
        0x74 => "f64x2.ceil",
        0x75 => "f64x2.floor",
        0x76 => "i8x16.min_s",
        0x77 => "i8x16.min_u",
        0x78 => "i8x16.max_s",
        0x79 => "i8x16.max_u",
        0x7a => "f64x2.trunc",
        0x7b => "i8x16.avgr_u",
        0x7c => "i16x8.extadd_pairwise_i8x16_s",
        0x7d => "i16x8.extadd_pairwise_i8x16_u",
        0x7e => "i32x4.extadd_pairwise_i16x8_s",
        0x7f => "i32x4.extadd_pairwise_i16x8_u",
        0x80 => "i16x8.abs",
        0x81 => "i16x8.neg",
        0x82 => "i16x8.q15mulr_sat_s",
        0x83 => "i16x8.all_true",
        0x84 => "i16x8.bitmask",
        0x85 => "i16x8.narrow_i32x4_s",
        0x86 => "i16x8.narrow_i32x4_u",
        0x87 => "i16x8.extend_low_i8x16_s",
        0x88 => "i16x8.extend_high_i8x16_s",
        0x89 => "i16x8.extend_low_i8x16_u",
        0x8a => "i16x8.extend_high_i8x16_u",
        0x8b => "i16x8.shl",
        0x8c => "i16x8.shr_s",
        0x8d => "i16x8.shr_u",
        0x8e => "i16x8.add",
        0x8f => "i16x8.add_sat_s",
        0x90 => "i16x8.add_sat_u",
        0x91 => "i16x8.sub",
        0x92 => "i16x8.sub_sat_s",
        0x93 => "i16x8.sub_sat_u",
        0x94 => "f64x2.nearest",
        0x95 => "i16x8.mul",
        0x96 => "i16x8.min_s",
        0x97 => "i16x8.min_u",
        0x98 => "i16x8.max_s",
        0x99 => "i16x8.max_u",
        0x9b => "i16x8.avgr_u",
        0x9c => "i16x8.extmul_low_i8x16_s",
        0x9d => "i16x8.extmul_high_i8x16_s",
        0x9e => "i16x8.extmul_low_i8x16_u",
        0x9f => "i16x8.extmul_high_i8x16_u",
        0xa0 => "i32x4.abs",
        0xa1 => "i32x4.neg",
        0xa3 => "i32x4.all_true",
        0xa4 => "i32x4.bitmask",
        0xa7 => "i32x4.extend_low_i16x8_s",
        0xa8 => "i32x4.extend_high_i16x8_s",
        0xa9 => "i32x4.extend_low_i16x8_u",
        0xaa => "i32x4.extend_high_i16x8_u",
        0xab => "i32x4.shl",
        0xac => "i32x4.shr_s",
        0xad => "i32x4.shr_u",
        0xae => "i32x4.add",
        0xb1 => "i32x4.sub",
        0xb5 => "i32x4.mul",
        0xb6 => "i32x4.min_s",
        0xb7 => "i32x4.min_u",
        0xb8 => "i32x4.max_s",
        0xb9 => "i32x4.max_u",
        0xba => "i32x4.dot_i16x8_s",
        0xbc => "i32x4.extmul_low_i16x8_s",
        0xbd => "i32x4.extmul_high_i16x8_s",
        0xbe => "i32x4.extmul_low_i16x8_u",
        0xbf => "i32x4.extmul_high_i16x8_u",
        0xc0 => "i64x2.abs",
        0xc1 => "i64x2.neg",
        0xc3 => "i64x2.all_true",
        0xc4 => "i64x2.bitmask",
        0xc7 => "i64x2.extend_low_i32x4_s",
        0xc8 => "i64x2.extend_high_i32x4_s",
        0xc9 => "i64x2.extend_low_i32x4_u",
        0xca => "i64x2.extend_high_i32x4_u",
        0xcb => "i64x2.shl",
        0xcc => "i64x2.shr_s",
        0xcd => "i64x2.shr_u",
        0xce => "i64x2.add",
        0xd1 => "i64x2.sub",
        0xd5 => "i64x2.mul",
        0xd6 => "i64x2.eq",
        0xd7 => "i64x2.ne",
        0xd8 => "i64x2.lt_s",
        0xd9 => "i64x2.gt_s",
        0xda => "i64x2.le_s",
        0xdb => "i64x2.ge_s",
        0xdc => "i64x2.extmul_low_i32x4_s",
        0xdd => "i64x2.extmul_high_i32x4_s",
        0xde => "i64x2.extmul_low_i32x4_u",
        0xdf => "i64x2.extmul_high_i32x4_u",
        0xe0 => "f32x4.abs",
        0xe1 => "f32x4.neg",
        0xe3 => "f32x4.sqrt",
        0xe4 => "f32x4.add",
        0xe5 => "f32x4.sub",
        0xe6 => "f32x4.mul",
        0xe7 => "f32x4.div",
        0xe8 => "f32x4.min",
        0xe9 => "f32x4.max",
        0xea => "f32x4.pmin",
        0xeb => "f32x4.pmax",
        0xec => "f64x2.abs",
        0xed => "f64x2.neg",
        0xef => "f64x2.sqrt",
        0xf0 => "f64x2.add",
        0xf1 => "f64x2.sub",
        0xf2 => "f64x2.mul",
        0xf3 => "f64x2.div",
        0xf4 => "f64x2.min",
        0xf5 => "f64x2.max",
        0xf6 => "f64x2.pmin",
        0xf7 => "f64x2.pmax",
        0xf8 => "i32x4.trunc_sat_f32x4_s",
        0xf9 => "i32x4.trunc_sat_f32x4_u",
        0xfa => "f32x4.convert_i32x4_s",
        0xfb => "f32x4.convert_i32x4_u",
        0xfc => "i32x4.trunc_sat_f64x2_s_zero",
        0xfd => "i32x4.trunc_sat_f64x2_u_zero",
        0xfe => "f64x2.convert_low_i32x4_s",
        0xff => "f64x2.convert_low_i32x4_u",
        _ => "unknown",
    }
}
