//! The two name maps of a PDB file.
//!
//! The PDB info stream (stream 1) ends in a hash map from stream names to stream indices, which
//! is how streams such as `/NAMES` or `SRCSRV` are found. The `/NAMES` stream in turn is a string
//! table whose offsets are used as ids by the file checksum records of every module.

use std::collections::HashMap;

use indexmap::IndexMap;
use uuid::Uuid;

use crate::bitmap::Bitmap;
use crate::cursor::ByteCursor;
use crate::error::{PdbError, PdbErrorKind, Result};

/// The signature of the `/NAMES` string table.
const NAME_TABLE_SIGNATURE: u32 = 0xeffe_effe;

/// The only supported version of the `/NAMES` string table.
const NAME_TABLE_VERSION: i32 = 1;

/// The PDB info stream: file identity and the named stream map.
#[derive(Debug, Clone, Default)]
pub(crate) struct NameIndex {
    pub(crate) version: u32,
    pub(crate) signature: u32,
    pub(crate) age: u32,
    pub(crate) guid: Uuid,
    /// Stream indices keyed by upper-cased stream name.
    streams: IndexMap<String, u32>,
}

impl NameIndex {
    #[tracing::instrument(level = "trace", name = "NameIndex::parse", skip_all)]
    pub(crate) fn parse(cursor: &mut ByteCursor) -> Result<Self> {
        let version = cursor.read_u32()?;
        let signature = cursor.read_u32()?;
        let age = cursor.read_u32()?;
        let guid = cursor.read_guid()?;

        let strings_size = cursor.read_u32()? as usize;
        let strings_start = cursor.position();
        cursor.skip(strings_size)?;

        let count = cursor.read_u32()?;
        let max = cursor.read_u32()?;

        let present = Bitmap::parse(cursor)?;
        let deleted = Bitmap::parse(cursor)?;
        if !deleted.is_empty() {
            return Err(PdbError::from(PdbErrorKind::DeletedNamesNotEmpty).at(cursor.position()));
        }

        let mut streams = IndexMap::new();
        for slot in 0..max as usize {
            if !present.contains(slot) {
                continue;
            }
            let name_offset = cursor.read_u32()? as usize;
            let stream = cursor.read_u32()?;
            if name_offset >= strings_size {
                return Err(PdbError::from(PdbErrorKind::UnexpectedEof).at(strings_start));
            }
            let name = cursor.read_cstring_at(strings_start + name_offset)?;
            streams.insert(name.to_uppercase(), stream);
        }

        if streams.len() != count as usize {
            return Err(PdbErrorKind::NameCountMismatch(streams.len() as u32, count).into());
        }

        Ok(Self {
            version,
            signature,
            age,
            guid,
            streams,
        })
    }

    /// Looks up a stream by name, ignoring case.
    pub(crate) fn get(&self, name: &str) -> Option<u32> {
        self.streams.get(&name.to_uppercase()).copied()
    }
}

/// The `/NAMES` string table, resolving string buffer offsets to names.
#[derive(Debug, Clone, Default)]
pub(crate) struct NameTable {
    names: HashMap<u32, String>,
}

impl NameTable {
    #[tracing::instrument(level = "trace", name = "NameTable::parse", skip_all)]
    pub(crate) fn parse(cursor: &mut ByteCursor) -> Result<Self> {
        let signature = cursor.read_u32()?;
        let version = cursor.read_i32()?;
        let strings_size = cursor.read_u32()? as usize;
        if signature != NAME_TABLE_SIGNATURE || version != NAME_TABLE_VERSION {
            return Err(PdbErrorKind::InvalidNameTable(signature, version).into());
        }

        let strings_start = cursor.position();
        cursor.skip(strings_size)?;

        let buckets = cursor.read_u32()?;
        let mut names = HashMap::new();
        for _ in 0..buckets {
            let id = cursor.read_u32()?;
            if id == 0 {
                continue;
            }
            if id as usize >= strings_size {
                return Err(PdbErrorKind::UnknownName(id).into());
            }
            let name = cursor.read_cstring_at(strings_start + id as usize)?;
            names.insert(id, name);
        }

        Ok(Self { names })
    }

    /// Resolves a name id to its string.
    pub(crate) fn get(&self, id: u32) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32s(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn name_index(deleted: &[u32]) -> Vec<u8> {
        let guid = uuid::uuid!("01234567-89ab-cdef-0123-456789abcdef");
        let strings = b"/names\0SRCSRV\0";

        let mut data = u32s(&[20000404, 0x1234, 3]);
        data.extend_from_slice(&guid.to_bytes_le());
        data.extend(u32s(&[strings.len() as u32]));
        data.extend_from_slice(strings);
        // two entries in a table of four slots, occupying slots 1 and 2
        data.extend(u32s(&[2, 4, 1, 0b0110]));
        data.extend(u32s(&[deleted.len() as u32]));
        data.extend(u32s(deleted));
        data.extend(u32s(&[0, 10, 7, 12]));
        data
    }

    #[test]
    fn test_name_index() {
        let index = NameIndex::parse(&mut ByteCursor::from_vec(name_index(&[]))).unwrap();
        assert_eq!(index.version, 20000404);
        assert_eq!(index.signature, 0x1234);
        assert_eq!(index.age, 3);
        assert_eq!(index.guid, uuid::uuid!("01234567-89ab-cdef-0123-456789abcdef"));

        assert_eq!(index.get("/NAMES"), Some(10));
        assert_eq!(index.get("/names"), Some(10));
        assert_eq!(index.get("srcsrv"), Some(12));
        assert_eq!(index.get("/LinkInfo"), None);
    }

    #[test]
    fn test_name_index_deleted_entries() {
        let err = NameIndex::parse(&mut ByteCursor::from_vec(name_index(&[1]))).unwrap_err();
        assert_eq!(err.kind(), PdbErrorKind::DeletedNamesNotEmpty);
    }

    #[test]
    fn test_name_index_count_mismatch() {
        let mut data = name_index(&[]);
        // patch the declared count from 2 to 3
        let count_offset = 28 + 4 + 14;
        data[count_offset..count_offset + 4].copy_from_slice(&3u32.to_le_bytes());
        let err = NameIndex::parse(&mut ByteCursor::from_vec(data)).unwrap_err();
        assert_eq!(err.kind(), PdbErrorKind::NameCountMismatch(2, 3));
    }

    fn name_table(signature: u32, version: u32) -> Vec<u8> {
        let strings = b"\0a.cs\0dir\\b.cs\0";
        let mut data = u32s(&[signature, version, strings.len() as u32]);
        data.extend_from_slice(strings);
        data.extend(u32s(&[4, 6, 0, 1, 0]));
        data.extend(u32s(&[2]));
        data
    }

    #[test]
    fn test_name_table() {
        let table =
            NameTable::parse(&mut ByteCursor::from_vec(name_table(0xeffeeffe, 1))).unwrap();
        assert_eq!(table.get(1), Some("a.cs"));
        assert_eq!(table.get(6), Some("dir\\b.cs"));
        assert_eq!(table.get(0), None);
        assert_eq!(table.get(2), None);
    }

    #[test]
    fn test_name_table_version() {
        let err =
            NameTable::parse(&mut ByteCursor::from_vec(name_table(0xeffeeffe, 2))).unwrap_err();
        assert_eq!(err.kind(), PdbErrorKind::InvalidNameTable(0xeffeeffe, 2));

        let err = NameTable::parse(&mut ByteCursor::from_vec(name_table(0, 1))).unwrap_err();
        assert_eq!(err.kind(), PdbErrorKind::InvalidNameTable(0, 1));
    }
}
