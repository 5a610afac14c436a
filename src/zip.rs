use crate::error::IngestError;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_SIG: u32 = 0x0605_4b50;
const END_OF_CENTRAL_LEN: usize = 22;
const MAX_COMMENT_LEN: usize = u16::MAX as usize;
const MAX_ENTRY_BYTES: usize = 256 * 1024 * 1024;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

#[derive(Debug, Clone)]
struct ZipEntry {
    name: String,
    method: u16,
    compressed_size: usize,
    uncompressed_size: usize,
    local_header_offset: usize,
}

/// Read-only view over the central directory of a zip container.
pub(crate) struct ZipArchive<'a> {
    data: &'a [u8],
    entries: Vec<ZipEntry>,
}

pub(crate) fn has_zip_signature(data: &[u8]) -> bool {
    data.len() >= 4 && read_u32(data, 0) == Some(LOCAL_HEADER_SIG)
}

fn corrupt(message: impl Into<String>) -> IngestError {
    IngestError::Workbook(message.into())
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl<'a> ZipArchive<'a> {
    pub(crate) fn parse(data: &'a [u8]) -> Result<Self, IngestError> {
        let eocd = find_end_of_central_directory(data)
            .ok_or_else(|| corrupt("zip end-of-central-directory record not found"))?;
        let entry_count = read_u16(data, eocd + 10).unwrap_or(0) as usize;
        let cd_offset = read_u32(data, eocd + 16).unwrap_or(u32::MAX);
        if cd_offset == u32::MAX {
            return Err(corrupt("zip64 containers are not supported"));
        }

        let mut entries = Vec::with_capacity(entry_count);
        let mut cursor = cd_offset as usize;
        for _ in 0..entry_count {
            if read_u32(data, cursor) != Some(CENTRAL_HEADER_SIG) {
                return Err(corrupt("bad central directory entry"));
            }
            let field = |offset: usize| read_u32(data, cursor + offset);
            let short = |offset: usize| read_u16(data, cursor + offset);
            let (
                Some(method),
                Some(compressed),
                Some(uncompressed),
                Some(name_len),
                Some(extra_len),
                Some(comment_len),
                Some(local_offset),
            ) = (
                short(10),
                field(20),
                field(24),
                short(28),
                short(30),
                short(32),
                field(42),
            )
            else {
                return Err(corrupt("truncated central directory"));
            };
            if compressed == u32::MAX || uncompressed == u32::MAX || local_offset == u32::MAX {
                return Err(corrupt("zip64 entries are not supported"));
            }
            let name_start = cursor + 46;
            let name_bytes = data
                .get(name_start..name_start + name_len as usize)
                .ok_or_else(|| corrupt("truncated entry name"))?;
            entries.push(ZipEntry {
                name: String::from_utf8_lossy(name_bytes).into_owned(),
                method,
                compressed_size: compressed as usize,
                uncompressed_size: uncompressed as usize,
                local_header_offset: local_offset as usize,
            });
            cursor = name_start + name_len as usize + extra_len as usize + comment_len as usize;
        }
        Ok(Self { data, entries })
    }

    /// Returns the decompressed bytes of `name`, matching exactly first and then
    /// ignoring ASCII case, or `None` when the container has no such part.
    pub(crate) fn read(&self, name: &str) -> Result<Option<Vec<u8>>, IngestError> {
        let name = name.trim_start_matches('/');
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.name == name)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|entry| entry.name.eq_ignore_ascii_case(name))
            });
        match entry {
            Some(entry) => self.extract(entry).map(Some),
            None => Ok(None),
        }
    }

    fn extract(&self, entry: &ZipEntry) -> Result<Vec<u8>, IngestError> {
        let offset = entry.local_header_offset;
        if read_u32(self.data, offset) != Some(LOCAL_HEADER_SIG) {
            return Err(corrupt(format!("bad local header for {}", entry.name)));
        }
        let (Some(name_len), Some(extra_len)) =
            (read_u16(self.data, offset + 26), read_u16(self.data, offset + 28))
        else {
            return Err(corrupt(format!("truncated local header for {}", entry.name)));
        };
        let start = offset + 30 + name_len as usize + extra_len as usize;
        let raw = self
            .data
            .get(start..start + entry.compressed_size)
            .ok_or_else(|| corrupt(format!("truncated data for {}", entry.name)))?;
        match entry.method {
            METHOD_STORED => Ok(raw.to_vec()),
            METHOD_DEFLATE => {
                let limit = entry.uncompressed_size.clamp(1, MAX_ENTRY_BYTES);
                miniz_oxide::inflate::decompress_to_vec_with_limit(raw, limit)
                    .map_err(|err| corrupt(format!("cannot inflate {}: {:?}", entry.name, err.status)))
            }
            other => Err(corrupt(format!(
                "unsupported compression method {} for {}",
                other, entry.name
            ))),
        }
    }
}

fn find_end_of_central_directory(data: &[u8]) -> Option<usize> {
    if data.len() < END_OF_CENTRAL_LEN {
        return None;
    }
    let last = data.len() - END_OF_CENTRAL_LEN;
    let first = last.saturating_sub(MAX_COMMENT_LEN);
    (first..=last)
        .rev()
        .find(|&offset| read_u32(data, offset) == Some(END_OF_CENTRAL_SIG))
}

/// Builds a zip container in memory. Test fixtures only; CRCs are left zero
/// because the reader does not verify them.
#[cfg(test)]
pub(crate) fn build_zip(parts: &[(&str, &[u8], bool)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();
    for (name, body, deflate) in parts {
        let payload = if *deflate {
            miniz_oxide::deflate::compress_to_vec(body, 6)
        } else {
            body.to_vec()
        };
        let method = if *deflate { METHOD_DEFLATE } else { METHOD_STORED };
        let offset = out.len() as u32;

        out.extend_from_slice(&LOCAL_HEADER_SIG.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&method.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&payload);

        central.extend_from_slice(&CENTRAL_HEADER_SIG.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&method.to_le_bytes());
        central.extend_from_slice(&[0u8; 8]);
        central.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        central.extend_from_slice(&(body.len() as u32).to_le_bytes());
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        central.extend_from_slice(&[0u8; 12]);
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(name.as_bytes());
    }
    let cd_offset = out.len() as u32;
    out.extend_from_slice(&central);
    out.extend_from_slice(&END_OF_CENTRAL_SIG.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&(parts.len() as u16).to_le_bytes());
    out.extend_from_slice(&(parts.len() as u16).to_le_bytes());
    out.extend_from_slice(&(central.len() as u32).to_le_bytes());
    out.extend_from_slice(&cd_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_stored_and_deflated_parts() {
        let long = "row ".repeat(500);
        let bytes = build_zip(&[
            ("a.txt", b"stored body", false),
            ("dir/B.xml", long.as_bytes(), true),
        ]);
        assert!(has_zip_signature(&bytes));
        let archive = ZipArchive::parse(&bytes).expect("archive");
        assert_eq!(
            archive.read("a.txt").expect("read"),
            Some(b"stored body".to_vec())
        );
        assert_eq!(
            archive.read("/dir/b.xml").expect("read"),
            Some(long.into_bytes())
        );
        assert_eq!(archive.read("missing").expect("read"), None);
    }

    #[test]
    fn rejects_non_zip_bytes() {
        assert!(!has_zip_signature(b"a,b,c"));
        let err = ZipArchive::parse(b"definitely not a zip container").err().expect("error");
        assert!(matches!(err, IngestError::Workbook(_)));
    }
}
