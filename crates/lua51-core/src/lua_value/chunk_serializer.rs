// Binary chunk loader/dumper, bit-exact with the Lua 5.1 format.
//
// Header: 0x1B "Lua" 0x51, format 0, endianness flag, sizeof(int),
// sizeof(size_t), sizeof(Instruction), sizeof(lua_Number), integral flag.
// The loader accepts only chunks matching the host layout; Lua 5.1 does
// not promise cross-architecture chunks.

use std::rc::Rc;

use crate::gc::ObjectPool;
use crate::lua_value::{Chunk, LocVar, LuaValue};
use crate::lua_vm::{LuaError, LuaResult};

const SIGNATURE: &[u8; 4] = b"\x1bLua";
const VERSION: u8 = 0x51;
const FORMAT: u8 = 0;

const SIZE_INT: u8 = 4;
const SIZE_SIZET: u8 = std::mem::size_of::<usize>() as u8;
const SIZE_INSTR: u8 = 4;
const SIZE_NUMBER: u8 = 8;

// constant tags (LUA_TNIL etc. as serialized)
const TAG_NIL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

#[cfg(target_endian = "little")]
const ENDIANNESS: u8 = 1;
#[cfg(target_endian = "big")]
const ENDIANNESS: u8 = 0;

// ============ Reader ============

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> LuaResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(LuaError::SyntaxError)?;
        if end > self.data.len() {
            return Err(LuaError::SyntaxError);
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn byte(&mut self) -> LuaResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn int(&mut self) -> LuaResult<i32> {
        let b = self.bytes(4)?;
        Ok(i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> LuaResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn size(&mut self) -> LuaResult<usize> {
        let b = self.bytes(std::mem::size_of::<usize>())?;
        let mut buf = [0u8; std::mem::size_of::<usize>()];
        buf.copy_from_slice(b);
        Ok(usize::from_ne_bytes(buf))
    }

    fn number(&mut self) -> LuaResult<f64> {
        let b = self.bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(f64::from_ne_bytes(buf))
    }

    /// A serialized string: size_t length including the trailing NUL, or 0
    /// for the absent string.
    fn string(&mut self) -> LuaResult<Option<Vec<u8>>> {
        let len = self.size()?;
        if len == 0 {
            return Ok(None);
        }
        let raw = self.bytes(len)?;
        Ok(Some(raw[..len - 1].to_vec())) // drop the NUL
    }

    fn count(&mut self) -> LuaResult<usize> {
        let n = self.int()?;
        if n < 0 {
            return Err(LuaError::SyntaxError);
        }
        Ok(n as usize)
    }
}

// ============ Load ============

/// Load a binary chunk, interning its string constants into the pool.
pub fn undump(data: &[u8], pool: &mut ObjectPool, white: u8) -> LuaResult<Rc<Chunk>> {
    let mut r = Reader::new(data);
    check_header(&mut r)?;
    let chunk = load_function(&mut r, pool, white)?;
    Ok(Rc::new(chunk))
}

fn check_header(r: &mut Reader<'_>) -> LuaResult<()> {
    if r.bytes(4)? != SIGNATURE {
        return Err(LuaError::SyntaxError);
    }
    let expect = [
        VERSION, FORMAT, ENDIANNESS, SIZE_INT, SIZE_SIZET, SIZE_INSTR, SIZE_NUMBER, 0,
    ];
    for want in expect {
        if r.byte()? != want {
            return Err(LuaError::SyntaxError);
        }
    }
    Ok(())
}

fn load_function(r: &mut Reader<'_>, pool: &mut ObjectPool, white: u8) -> LuaResult<Chunk> {
    let mut chunk = Chunk::new();
    chunk.source = r.string()?;
    chunk.line_defined = r.int()?;
    chunk.last_line_defined = r.int()?;
    chunk.num_upvalues = r.byte()?;
    chunk.num_params = r.byte()?;
    chunk.is_vararg = r.byte()?;
    chunk.max_stack_size = r.byte()?;

    // code
    let ncode = r.count()?;
    chunk.code.reserve(ncode);
    for _ in 0..ncode {
        chunk.code.push(r.u32()?);
    }

    // constants
    let nconst = r.count()?;
    chunk.constants.reserve(nconst);
    for _ in 0..nconst {
        let v = match r.byte()? {
            TAG_NIL => LuaValue::nil(),
            TAG_BOOLEAN => LuaValue::boolean(r.byte()? != 0),
            TAG_NUMBER => LuaValue::number(r.number()?),
            TAG_STRING => {
                let s = r.string()?.ok_or(LuaError::SyntaxError)?;
                LuaValue::string(pool.create_string(&s, white))
            }
            _ => return Err(LuaError::SyntaxError),
        };
        chunk.constants.push(v);
    }

    // nested prototypes
    let nproto = r.count()?;
    chunk.protos.reserve(nproto);
    for _ in 0..nproto {
        chunk.protos.push(Rc::new(load_function(r, pool, white)?));
    }

    // debug: line info
    let nlines = r.count()?;
    chunk.line_info.reserve(nlines);
    for _ in 0..nlines {
        chunk.line_info.push(r.int()?);
    }

    // debug: local variables
    let nlocals = r.count()?;
    for _ in 0..nlocals {
        let name = r.string()?.unwrap_or_default();
        let start_pc = r.int()? as u32;
        let end_pc = r.int()? as u32;
        chunk.locals.push(LocVar { name, start_pc, end_pc });
    }

    // debug: upvalue names
    let nups = r.count()?;
    for _ in 0..nups {
        chunk.upvalue_names.push(r.string()?.unwrap_or_default());
    }

    Ok(chunk)
}

// ============ Dump ============

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(256) }
    }

    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn int(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn size(&mut self, v: usize) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn number(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn string(&mut self, s: Option<&[u8]>) {
        match s {
            None => self.size(0),
            Some(bytes) => {
                self.size(bytes.len() + 1);
                self.buf.extend_from_slice(bytes);
                self.byte(0);
            }
        }
    }
}

/// Serialize a prototype back to the binary format. With `strip`, debug
/// info (source names, line info, locals, upvalue names) is omitted.
pub fn dump(chunk: &Chunk, pool: &ObjectPool, strip: bool) -> Vec<u8> {
    let mut w = Writer::new();
    w.buf.extend_from_slice(SIGNATURE);
    for b in [VERSION, FORMAT, ENDIANNESS, SIZE_INT, SIZE_SIZET, SIZE_INSTR, SIZE_NUMBER, 0] {
        w.byte(b);
    }
    dump_function(&mut w, chunk, pool, strip);
    w.buf
}

fn dump_function(w: &mut Writer, chunk: &Chunk, pool: &ObjectPool, strip: bool) {
    if strip {
        w.string(None);
    } else {
        w.string(chunk.source.as_deref());
    }
    w.int(chunk.line_defined);
    w.int(chunk.last_line_defined);
    w.byte(chunk.num_upvalues);
    w.byte(chunk.num_params);
    w.byte(chunk.is_vararg);
    w.byte(chunk.max_stack_size);

    w.int(chunk.code.len() as i32);
    for &ins in &chunk.code {
        w.u32(ins);
    }

    w.int(chunk.constants.len() as i32);
    for c in &chunk.constants {
        if c.is_nil() {
            w.byte(TAG_NIL);
        } else if c.is_boolean() {
            w.byte(TAG_BOOLEAN);
            w.byte(c.bvalue() as u8);
        } else if c.is_number() {
            w.byte(TAG_NUMBER);
            w.number(c.nvalue());
        } else if c.is_string() {
            w.byte(TAG_STRING);
            w.string(Some(pool.string_bytes(c.tsvalue())));
        } else {
            // the loader can never produce other constant kinds
            w.byte(TAG_NIL);
        }
    }

    w.int(chunk.protos.len() as i32);
    for sub in &chunk.protos {
        dump_function(w, sub, pool, strip);
    }

    if strip {
        w.int(0);
        w.int(0);
        w.int(0);
    } else {
        w.int(chunk.line_info.len() as i32);
        for &l in &chunk.line_info {
            w.int(l);
        }
        w.int(chunk.locals.len() as i32);
        for lv in &chunk.locals {
            w.string(Some(&lv.name));
            w.int(lv.start_pc as i32);
            w.int(lv.end_pc as i32);
        }
        w.int(chunk.upvalue_names.len() as i32);
        for name in &chunk.upvalue_names {
            w.string(Some(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::object_pool::WHITE0;
    use crate::lua_vm::{Instruction, OpCode};

    fn sample_chunk(pool: &mut ObjectPool) -> Chunk {
        let mut c = Chunk::new();
        c.source = Some(b"@sample.lua".to_vec());
        c.line_defined = 0;
        c.last_line_defined = 9;
        c.num_params = 1;
        c.max_stack_size = 4;
        c.code = vec![
            Instruction::create_abx(OpCode::LoadK, 1, 0),
            Instruction::create_abc(OpCode::Add, 2, 0, 1),
            Instruction::create_abc(OpCode::Return, 2, 2, 0),
        ];
        c.constants = vec![
            LuaValue::number(42.0),
            LuaValue::boolean(true),
            LuaValue::nil(),
            LuaValue::string(pool.create_string(b"answer", WHITE0)),
        ];
        c.line_info = vec![1, 2, 3];
        c.locals = vec![LocVar { name: b"x".to_vec(), start_pc: 0, end_pc: 3 }];
        c.upvalue_names = vec![];
        c
    }

    #[test]
    fn test_roundtrip_is_byte_identical() {
        let mut pool = ObjectPool::new();
        let chunk = sample_chunk(&mut pool);
        let dumped = dump(&chunk, &pool, false);
        let loaded = undump(&dumped, &mut pool, WHITE0).unwrap();
        let redumped = dump(&loaded, &pool, false);
        assert_eq!(dumped, redumped);
    }

    #[test]
    fn test_roundtrip_preserves_fields() {
        let mut pool = ObjectPool::new();
        let chunk = sample_chunk(&mut pool);
        let dumped = dump(&chunk, &pool, false);
        let loaded = undump(&dumped, &mut pool, WHITE0).unwrap();
        assert_eq!(loaded.code, chunk.code);
        assert_eq!(loaded.num_params, 1);
        assert_eq!(loaded.max_stack_size, 4);
        assert_eq!(loaded.source.as_deref(), Some(b"@sample.lua".as_slice()));
        assert_eq!(loaded.constants.len(), 4);
        assert!(loaded.constants[0].raw_equal(&LuaValue::number(42.0)));
        assert!(loaded.constants[1].raw_equal(&LuaValue::boolean(true)));
        assert!(loaded.constants[2].is_nil());
        // interning: the string constant must be the same handle
        assert_eq!(
            loaded.constants[3].as_string_id(),
            Some(pool.create_string(b"answer", WHITE0))
        );
        assert_eq!(loaded.line_info, vec![1, 2, 3]);
    }

    #[test]
    fn test_nested_prototypes() {
        let mut pool = ObjectPool::new();
        let mut inner = Chunk::new();
        inner.num_upvalues = 1;
        inner.max_stack_size = 2;
        inner.code = vec![Instruction::create_abc(OpCode::Return, 0, 1, 0)];
        let mut outer = sample_chunk(&mut pool);
        outer.protos.push(std::rc::Rc::new(inner));

        let dumped = dump(&outer, &pool, false);
        let loaded = undump(&dumped, &mut pool, WHITE0).unwrap();
        assert_eq!(loaded.protos.len(), 1);
        assert_eq!(loaded.protos[0].num_upvalues, 1);
    }

    #[test]
    fn test_strip_removes_debug_info() {
        let mut pool = ObjectPool::new();
        let chunk = sample_chunk(&mut pool);
        let stripped = dump(&chunk, &pool, true);
        let loaded = undump(&stripped, &mut pool, WHITE0).unwrap();
        assert!(loaded.source.is_none());
        assert!(loaded.line_info.is_empty());
        assert!(loaded.locals.is_empty());
        // stripping twice is stable
        assert_eq!(dump(&loaded, &pool, true), stripped);
    }

    #[test]
    fn test_rejects_bad_signature() {
        let mut pool = ObjectPool::new();
        assert_eq!(
            undump(b"\x1bLUA\x51", &mut pool, WHITE0).unwrap_err(),
            LuaError::SyntaxError
        );
    }

    #[test]
    fn test_rejects_wrong_version_and_sizes() {
        let mut pool = ObjectPool::new();
        let chunk = sample_chunk(&mut pool);
        let mut dumped = dump(&chunk, &pool, true);
        dumped[4] = 0x52; // claim Lua 5.2
        assert!(undump(&dumped, &mut pool, WHITE0).is_err());

        let mut dumped2 = dump(&chunk, &pool, true);
        dumped2[8] = 8; // claim 8-byte ints
        assert!(undump(&dumped2, &mut pool, WHITE0).is_err());
    }

    #[test]
    fn test_rejects_truncated_chunk() {
        let mut pool = ObjectPool::new();
        let chunk = sample_chunk(&mut pool);
        let dumped = dump(&chunk, &pool, false);
        for cut in [3, 12, 20, dumped.len() - 1] {
            assert!(undump(&dumped[..cut], &mut pool, WHITE0).is_err());
        }
    }
}
