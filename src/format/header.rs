use std::io::{self, Read, Write};

use bytemuck::{Pod, Zeroable};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::core::Reference;
use crate::error::{HeaderError, Result};
use crate::{FILE_MAGIC, FILE_VERSION, MIN_FILE_VERSION};

/// Byte position of `master_offset` inside the fixed header, for the
/// finalize-time patch.
pub(crate) const MASTER_OFFSET_POS: u64 = 16;

/// The fixed-size file header.
///
/// This is stored identically in memory and on disk. Everything
/// variable-length (genome id, chromosome catalogue, resolutions) follows in
/// the preamble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct FileHeader {
    magic: [u8; 7],
    pub version: u8,
    reserved: [u8; 8],
    /// Offset of the master index; zero until the file is finalized
    pub master_offset: u64,
}
impl FileHeader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *FILE_MAGIC,
            version: FILE_VERSION,
            reserved: [0; 8],
            master_offset: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < size_of::<Self>() {
            return Err(HeaderError::Truncated(bytes.len() as u64).into());
        }
        let header: Self = *bytemuck::from_bytes(&bytes[..size_of::<Self>()]);
        if header.magic != *FILE_MAGIC {
            return Err(HeaderError::InvalidMagicBytes(header.magic).into());
        }
        if header.version < MIN_FILE_VERSION || header.version > FILE_VERSION {
            return Err(HeaderError::UnsupportedVersion {
                found: header.version,
                min: MIN_FILE_VERSION,
                max: FILE_VERSION,
            }
            .into());
        }
        Ok(header)
    }
}

/// The variable-length sections directly after the fixed header: genome id,
/// chromosome catalogue, and resolution list.
#[derive(Clone, Debug)]
pub(crate) struct Preamble {
    pub genome_id: String,
    pub reference: Reference,
    pub resolutions: Vec<u32>,
}

pub(crate) fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(value.len() as u32)?;
    writer.write_all(value.as_bytes())
}

pub(crate) fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(std::str::from_utf8(&buf)?.to_string())
}

pub(crate) fn write_preamble<W: Write>(writer: &mut W, preamble: &Preamble) -> Result<()> {
    write_string(writer, &preamble.genome_id)?;
    writer.write_u32::<LittleEndian>(preamble.reference.len() as u32)?;
    for chrom in preamble.reference.iter() {
        write_string(writer, chrom.name())?;
        writer.write_u64::<LittleEndian>(chrom.length())?;
    }
    writer.write_u32::<LittleEndian>(preamble.resolutions.len() as u32)?;
    for bin_size in &preamble.resolutions {
        writer.write_u32::<LittleEndian>(*bin_size)?;
    }
    Ok(())
}

pub(crate) fn read_preamble<R: Read>(reader: &mut R) -> Result<Preamble> {
    let genome_id = read_string(reader)?;

    let num_chromosomes = reader.read_u32::<LittleEndian>()?;
    let mut chromosomes = Vec::with_capacity(num_chromosomes as usize);
    for _ in 0..num_chromosomes {
        let name = read_string(reader)?;
        let length = reader.read_u64::<LittleEndian>()?;
        chromosomes.push((name, length));
    }
    let reference = Reference::new(chromosomes)?;

    let num_resolutions = reader.read_u32::<LittleEndian>()?;
    if num_resolutions == 0 {
        return Err(HeaderError::InvalidResolutions("empty resolution list".to_string()).into());
    }
    let mut resolutions = Vec::with_capacity(num_resolutions as usize);
    for _ in 0..num_resolutions {
        resolutions.push(reader.read_u32::<LittleEndian>()?);
    }
    if resolutions.windows(2).any(|w| w[0] >= w[1]) {
        return Err(
            HeaderError::InvalidResolutions("resolutions not strictly ascending".to_string())
                .into(),
        );
    }

    Ok(Preamble {
        genome_id,
        reference,
        resolutions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn preamble() -> Preamble {
        Preamble {
            genome_id: "hg38".to_string(),
            reference: Reference::new([("chr1", 1000u64), ("chr2", 500)]).unwrap(),
            resolutions: vec![100, 300],
        }
    }

    // ==================== FileHeader Tests ====================

    #[test]
    fn test_file_header_round_trip() {
        let mut header = FileHeader::new();
        header.master_offset = 12345;
        let parsed = FileHeader::from_bytes(header.as_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_file_header_rejects_bad_magic() {
        let mut header = FileHeader::new();
        header.magic = *b"BADFILE";
        assert!(FileHeader::from_bytes(header.as_bytes()).is_err());
    }

    #[test]
    fn test_file_header_version_floor_and_ceiling() {
        let mut header = FileHeader::new();
        header.version = 0;
        assert!(FileHeader::from_bytes(header.as_bytes()).is_err());
        header.version = FILE_VERSION + 1;
        assert!(FileHeader::from_bytes(header.as_bytes()).is_err());
        header.version = MIN_FILE_VERSION;
        assert!(FileHeader::from_bytes(header.as_bytes()).is_ok());
    }

    #[test]
    fn test_file_header_truncated() {
        let header = FileHeader::new();
        let bytes = header.as_bytes();
        assert!(FileHeader::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_master_offset_position() {
        let mut header = FileHeader::new();
        header.master_offset = 0x1122_3344_5566_7788;
        let bytes = header.as_bytes();
        let field = &bytes[MASTER_OFFSET_POS as usize..MASTER_OFFSET_POS as usize + 8];
        assert_eq!(u64::from_le_bytes(field.try_into().unwrap()), header.master_offset);
    }

    // ==================== Preamble Tests ====================

    #[test]
    fn test_preamble_round_trip() {
        let original = preamble();
        let mut buf = Vec::new();
        write_preamble(&mut buf, &original).unwrap();

        let parsed = read_preamble(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(parsed.genome_id, "hg38");
        assert_eq!(parsed.resolutions, vec![100, 300]);
        assert_eq!(parsed.reference.len(), 2);
        assert_eq!(parsed.reference.by_name("chr2").unwrap().length(), 500);
    }

    #[test]
    fn test_preamble_rejects_unsorted_resolutions() {
        let mut bad = preamble();
        bad.resolutions = vec![300, 100];
        let mut buf = Vec::new();
        write_preamble(&mut buf, &bad).unwrap();
        assert!(read_preamble(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn test_preamble_truncated() {
        let original = preamble();
        let mut buf = Vec::new();
        write_preamble(&mut buf, &original).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(read_preamble(&mut Cursor::new(&buf)).is_err());
    }
}
