//! Managed method records from a module's symbol stream.
//!
//! Every symbol record is framed as `[u16 length][u16 kind][payload]`, where the length counts
//! the kind and the payload. A managed procedure record starts a method and announces the
//! absolute offset of its terminating `S_END` record; block records open nested scopes the same
//! way. Everything between is attached to the innermost open scope, except the OEM records
//! carrying compiler-emitted custom metadata, which belong to the method itself.

use uuid::Uuid;

use crate::cursor::{ByteCursor, Decimal};
use crate::error::{PdbError, PdbErrorKind, Result};
use crate::lines::LineTable;

pub(crate) const S_END: u16 = 0x0006;
pub(crate) const S_OEM: u16 = 0x0404;
pub(crate) const S_BLOCK32: u16 = 0x1103;
pub(crate) const S_MANSLOT: u16 = 0x1120;
pub(crate) const S_UNAMESPACE: u16 = 0x1124;
pub(crate) const S_GMANPROC: u16 = 0x112a;
pub(crate) const S_LMANPROC: u16 = 0x112b;
pub(crate) const S_MANCONSTANT: u16 = 0x112d;

/// Vendor GUID of OEM records emitted for managed code.
pub(crate) const MSIL_METADATA_GUID: Uuid = uuid::uuid!("c6ea3fc9-59b3-49d6-bc25-0902bbabb460");

/// The deepest scope nesting accepted within one method, counting the method's root scope.
pub(crate) const MAX_SCOPE_DEPTH: usize = 256;

/// The custom metadata format version understood by this decoder.
const CUSTOM_METADATA_VERSION: u8 = 4;

const CMD_USING_INFO: u8 = 0;
const CMD_FORWARD_INFO: u8 = 1;
const CMD_FORWARD_TO_MODULE_INFO: u8 = 2;
const CMD_ITERATOR_SCOPES: u8 = 3;
const CMD_FORWARD_ITERATOR: u8 = 4;

/// A local variable slot declared in a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Slot {
    /// The index of the slot in the method's local signature.
    pub index: u32,
    /// Metadata token of the slot's type.
    pub type_token: u32,
    /// Code offset of the slot, unused for managed code.
    pub address: u32,
    /// Code segment of the slot, unused for managed code.
    pub segment: u16,
    /// Slot attributes, such as whether the local is compiler generated.
    pub flags: u16,
    /// The name of the local variable.
    pub name: String,
}

/// The value of a named constant.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ConstantValue {
    /// A signed 8-bit integer.
    I8(i8),
    /// A signed 16-bit integer.
    I16(i16),
    /// An unsigned 16-bit integer, also used for small values stored inline.
    U16(u16),
    /// A signed 32-bit integer.
    I32(i32),
    /// An unsigned 32-bit integer.
    U32(u32),
    /// A signed 64-bit integer.
    I64(i64),
    /// An unsigned 64-bit integer.
    U64(u64),
    /// A 32-bit float.
    F32(f32),
    /// A 64-bit float.
    F64(f64),
    /// A string.
    String(String),
    /// A 128-bit decimal.
    Decimal(Decimal),
}

/// A named constant declared in a scope.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Constant {
    /// Metadata token of the constant's type signature.
    pub token: u32,
    /// The value of the constant.
    pub value: ConstantValue,
    /// The name of the constant.
    pub name: String,
}

/// A lexical scope of a method body.
///
/// Offsets are relative to the start of the method.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Scope {
    /// The start of the scope relative to the method start.
    pub offset: u32,
    /// The length of the scope in bytes.
    pub length: u32,
    /// Local variable slots declared directly in this scope.
    pub slots: Vec<Slot>,
    /// Constants declared directly in this scope.
    pub constants: Vec<Constant>,
    /// Namespaces imported directly in this scope.
    pub namespaces: Vec<String>,
    /// Nested scopes.
    pub scopes: Vec<Scope>,
}

impl Scope {
    /// The depth of the scope tree rooted at this scope, counting this scope.
    pub fn depth(&self) -> usize {
        1 + self.scopes.iter().map(Scope::depth).max().unwrap_or(0)
    }

    /// Iterates this scope and all nested scopes in pre-order.
    pub fn walk(&self) -> impl Iterator<Item = &Scope> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let scope = stack.pop()?;
            stack.extend(scope.scopes.iter().rev());
            Some(scope)
        })
    }
}

/// A range of hoisted locals in an iterator or async state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct IteratorScope {
    /// The start offset of the range.
    pub offset: u32,
    /// The length of the range.
    pub length: u32,
}

/// An await point of an async method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SyncPoint {
    /// The IL offset of the await.
    pub sync_offset: u32,
    /// The method continuing after the await.
    pub continuation_method: u32,
    /// The IL offset in the continuation method.
    pub continuation_offset: u32,
}

/// State machine information of an async method's `MoveNext` method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AsyncMethodInfo {
    /// The user-written method that starts the state machine.
    pub kickoff_method: u32,
    /// The IL offset of the generated catch handler, `0` if there is none.
    pub catch_handler_offset: u32,
    /// The await points of the method.
    pub sync_points: Vec<SyncPoint>,
}

/// The debug information of one managed method.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MethodRecord {
    /// The method definition token.
    pub token: u32,
    /// The section of the method's code.
    pub segment: u16,
    /// The offset of the method's code within its section.
    pub address: u32,
    /// The length of the method's code in bytes.
    pub length: u32,
    /// Procedure flags.
    pub flags: u8,
    /// The name of the method, unless names are discarded.
    pub name: Option<String>,
    /// The scope spanning the whole method body.
    pub scope: Scope,
    /// The number of namespaces imported at each nesting level of the enclosing namespaces.
    pub using_counts: Vec<u16>,
    /// The method whose using information this method shares.
    pub forward_token: Option<u32>,
    /// The method holding the using information for the whole module.
    pub forward_module_token: Option<u32>,
    /// The name of the generated iterator or state machine class.
    pub iterator_class: Option<String>,
    /// Ranges of hoisted locals.
    pub iterator_scopes: Vec<IteratorScope>,
    /// Async state machine information.
    pub async_info: Option<AsyncMethodInfo>,
    /// Line tables, one per contributing source file.
    pub lines: Vec<LineTable>,
}

impl MethodRecord {
    /// The total number of line records over all line tables.
    pub fn line_count(&self) -> usize {
        self.lines.iter().map(|table| table.lines.len()).sum()
    }
}

/// Reads the `[u16 length][u16 kind]` header of the record at the current position.
///
/// Returns the record kind and the absolute offset of the next record, which must not lie beyond
/// `limit`.
pub(crate) fn read_record_header(cursor: &mut ByteCursor, limit: usize) -> Result<(u16, usize)> {
    let start = cursor.position();
    let len = cursor.read_u16()? as usize;
    let kind = cursor.read_u16()?;
    let stop = start + 2 + len;
    if stop > limit {
        return Err(PdbError::from(PdbErrorKind::UnexpectedEof).at(start));
    }
    Ok((kind, stop))
}

/// Reads the vendor GUID, type index and name of an OEM record.
///
/// Only the managed metadata vendor is supported.
pub(crate) fn read_oem_name(cursor: &mut ByteCursor) -> Result<String> {
    let start = cursor.position();
    if cursor.read_guid()? != MSIL_METADATA_GUID {
        return Err(PdbError::from(PdbErrorKind::UnknownOemVendor).at(start));
    }
    let _type_index = cursor.read_u32()?;
    cursor.read_utf16_string()
}

/// A scope whose end record has not been reached yet.
struct OpenScope {
    scope: Scope,
    end: usize,
}

/// Decodes all managed methods from a module stream.
///
/// The stream is staged in `cursor`, and its symbol region ends at `symbols_end`.
#[tracing::instrument(level = "trace", name = "decode_methods", skip(cursor))]
pub(crate) fn decode_methods(
    cursor: &mut ByteCursor,
    symbols_end: usize,
    keep_names: bool,
) -> Result<Vec<MethodRecord>> {
    cursor.set_position(0)?;
    let signature = cursor.read_u32()?;
    if signature != 4 {
        return Err(PdbError::from(PdbErrorKind::InvalidModuleSignature(signature)).at(0));
    }

    let mut methods = Vec::new();
    while cursor.position() < symbols_end {
        let (kind, stop) = read_record_header(cursor, symbols_end)?;
        match kind {
            S_GMANPROC | S_LMANPROC => {
                methods.push(decode_method(cursor, stop, symbols_end, keep_names)?);
            }
            _ => {
                tracing::trace!(kind, "skipping module-level symbol record");
                cursor.set_position(stop)?;
            }
        }
    }

    Ok(methods)
}

/// Decodes one managed procedure whose header ends at `stop`, including its body and `S_END`.
fn decode_method(
    cursor: &mut ByteCursor,
    stop: usize,
    limit: usize,
    keep_names: bool,
) -> Result<MethodRecord> {
    let _parent = cursor.read_u32()?;
    let end = cursor.read_u32()? as usize;
    let _next = cursor.read_u32()?;
    let length = cursor.read_u32()?;
    let _debug_start = cursor.read_u32()?;
    let _debug_end = cursor.read_u32()?;
    let token = cursor.read_u32()?;
    let address = cursor.read_u32()?;
    let segment = cursor.read_u16()?;
    let flags = cursor.read_u8()?;
    let _return_register = cursor.read_u16()?;
    let name = if keep_names {
        Some(cursor.read_cstring()?)
    } else {
        None
    };
    cursor.set_position(stop)?;

    let mut method = MethodRecord {
        token,
        segment,
        address,
        length,
        flags,
        name,
        ..Default::default()
    };

    let mut stack = vec![OpenScope {
        scope: Scope {
            offset: 0,
            length,
            ..Default::default()
        },
        end,
    }];

    loop {
        let depth = stack.len();
        let Some(top) = stack.last_mut() else {
            break;
        };
        let position = cursor.position();

        if position >= top.end {
            if position != top.end {
                return Err(PdbError::from(PdbErrorKind::NotAtEnd).at(position));
            }
            let (kind, stop) = read_record_header(cursor, limit)?;
            if kind != S_END {
                return Err(PdbError::from(PdbErrorKind::MissingEnd(kind)).at(position));
            }
            cursor.set_position(stop)?;

            let closed = stack.pop().map(|open| open.scope).unwrap_or_default();
            match stack.last_mut() {
                Some(parent) => parent.scope.scopes.push(closed),
                None => method.scope = closed,
            }
            continue;
        }

        let (kind, stop) = read_record_header(cursor, limit)?;
        let mut opened = None;
        match kind {
            S_BLOCK32 => {
                if depth >= MAX_SCOPE_DEPTH {
                    return Err(PdbError::from(PdbErrorKind::ScopeTooDeep(depth)).at(position));
                }
                let _parent = cursor.read_u32()?;
                let end = cursor.read_u32()? as usize;
                let length = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let _segment = cursor.read_u16()?;
                let offset = offset
                    .checked_sub(method.address)
                    .ok_or_else(|| PdbError::from(PdbErrorKind::InvalidScope).at(position))?;
                opened = Some(OpenScope {
                    scope: Scope {
                        offset,
                        length,
                        ..Default::default()
                    },
                    end,
                });
            }
            S_MANSLOT => top.scope.slots.push(read_slot(cursor)?),
            S_MANCONSTANT => top.scope.constants.push(read_constant(cursor)?),
            S_UNAMESPACE => top.scope.namespaces.push(cursor.read_cstring()?),
            S_OEM if depth == 1 => read_custom_metadata(cursor, stop, &mut method)?,
            _ => tracing::trace!(kind, position, "skipping symbol record"),
        }

        cursor.set_position(stop)?;
        stack.extend(opened);
    }

    Ok(method)
}

fn read_slot(cursor: &mut ByteCursor) -> Result<Slot> {
    Ok(Slot {
        index: cursor.read_u32()?,
        type_token: cursor.read_u32()?,
        address: cursor.read_u32()?,
        segment: cursor.read_u16()?,
        flags: cursor.read_u16()?,
        name: cursor.read_cstring()?,
    })
}

fn read_constant(cursor: &mut ByteCursor) -> Result<Constant> {
    let token = cursor.read_u32()?;
    let value = read_constant_value(cursor)?;
    let name = cursor.read_cstring()?;
    Ok(Constant { token, value, name })
}

/// Reads a numeric leaf: either a small literal or a type tag followed by the value.
fn read_constant_value(cursor: &mut ByteCursor) -> Result<ConstantValue> {
    let position = cursor.position();
    let tag = cursor.read_u16()?;
    if tag < 0x8000 {
        return Ok(ConstantValue::U16(tag));
    }

    Ok(match tag {
        0x8000 => ConstantValue::I8(cursor.read_i8()?),
        0x8001 => ConstantValue::I16(cursor.read_i16()?),
        0x8002 => ConstantValue::U16(cursor.read_u16()?),
        0x8003 => ConstantValue::I32(cursor.read_i32()?),
        0x8004 => ConstantValue::U32(cursor.read_u32()?),
        0x8005 => ConstantValue::F32(cursor.read_f32()?),
        0x8006 => ConstantValue::F64(cursor.read_f64()?),
        0x8009 => ConstantValue::I64(cursor.read_i64()?),
        0x800a => ConstantValue::U64(cursor.read_u64()?),
        0x8010 => ConstantValue::String(cursor.read_bstring()?),
        0x8019 => ConstantValue::Decimal(cursor.read_decimal()?),
        _ => return Err(PdbError::from(PdbErrorKind::InvalidConstantTag(tag)).at(position)),
    })
}

/// Decodes a method-level OEM record ending at `stop` into `method`.
fn read_custom_metadata(
    cursor: &mut ByteCursor,
    stop: usize,
    method: &mut MethodRecord,
) -> Result<()> {
    let name = read_oem_name(cursor)?;
    match name.as_str() {
        "MD2" => read_md2(cursor, stop, method),
        "asyncMethodInfo" => {
            method.async_info = Some(read_async_info(cursor)?);
            Ok(())
        }
        _ => {
            tracing::debug!(name, "skipping unknown custom metadata record");
            Ok(())
        }
    }
}

fn read_md2(cursor: &mut ByteCursor, stop: usize, method: &mut MethodRecord) -> Result<()> {
    let version = cursor.read_u8()?;
    if version != CUSTOM_METADATA_VERSION {
        tracing::debug!(version, "skipping custom metadata block");
        return Ok(());
    }
    let count = cursor.read_u8()?;
    cursor.align(4)?;

    for _ in 0..count {
        let start = cursor.position();
        let version = cursor.read_u8()?;
        if version != CUSTOM_METADATA_VERSION {
            return Err(
                PdbError::from(PdbErrorKind::UnsupportedCustomMetadataVersion(version)).at(start),
            );
        }
        let kind = cursor.read_u8()?;
        cursor.align(4)?;
        let size = cursor.read_u32()? as usize;
        let item_end = start + size;
        if item_end > stop || item_end < cursor.position() {
            return Err(PdbError::from(PdbErrorKind::InvalidCustomMetadata).at(start));
        }

        match kind {
            CMD_USING_INFO => {
                let count = cursor.read_u16()?;
                method.using_counts = (0..count)
                    .map(|_| cursor.read_u16())
                    .collect::<Result<_>>()?;
            }
            CMD_FORWARD_INFO => method.forward_token = Some(cursor.read_u32()?),
            CMD_FORWARD_TO_MODULE_INFO => method.forward_module_token = Some(cursor.read_u32()?),
            CMD_ITERATOR_SCOPES => {
                let count = cursor.read_u32()?;
                let mut scopes = Vec::new();
                for _ in 0..count {
                    let offset = cursor.read_u32()?;
                    let end = cursor.read_u32()?;
                    let length = end.checked_sub(offset).ok_or_else(|| {
                        PdbError::from(PdbErrorKind::InvalidCustomMetadata).at(start)
                    })?;
                    scopes.push(IteratorScope { offset, length });
                }
                method.iterator_scopes = scopes;
            }
            CMD_FORWARD_ITERATOR => method.iterator_class = Some(cursor.read_utf16_string()?),
            _ => tracing::trace!(kind, size, "skipping custom metadata item"),
        }

        cursor.set_position(item_end)?;
    }

    Ok(())
}

fn read_async_info(cursor: &mut ByteCursor) -> Result<AsyncMethodInfo> {
    let kickoff_method = cursor.read_u32()?;
    let catch_handler_offset = cursor.read_u32()?;
    let count = cursor.read_u32()?;
    let mut sync_points = Vec::new();
    for _ in 0..count {
        sync_points.push(SyncPoint {
            sync_offset: cursor.read_u32()?,
            continuation_method: cursor.read_u32()?,
            continuation_offset: cursor.read_u32()?,
        });
    }
    Ok(AsyncMethodInfo {
        kickoff_method,
        catch_handler_offset,
        sync_points,
    })
}
