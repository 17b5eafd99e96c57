//! Loader of Lama VM bytecode files

use std::fmt::Display;
use std::fs;
use std::path::Path;

// Hard caps on the header fields; anything larger is a corrupt or
// hostile image, not a real program.
const MAX_STRING_TABLE_SIZE: u32 = 100 * 1024 * 1024; // 100 MiB
const MAX_GLOBAL_AREA_SIZE: u32 = 10 * 1024 * 1024; // 10 million words
const MAX_PUBLIC_SYMBOLS: u32 = 1_000_000;
const HEADER_SIZE: usize = 3 * 4;

#[derive(Debug)]
pub enum BytefileError {
    Io(std::io::Error),
    Oversize(u64),
    HeaderInsane {
        string_table: u32,
        global_area: u32,
        publics: u32,
    },
    Truncated {
        expected: usize,
        actual: usize,
    },
    StringOob {
        offset: usize,
        table_size: usize,
    },
    UnterminatedString {
        offset: usize,
    },
    PublicOob {
        index: usize,
        count: usize,
    },
    MainMissing {
        available: Vec<String>,
    },
    EntryOutOfCode {
        offset: usize,
        code_size: usize,
    },
}

impl Display for BytefileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BytefileError::Io(err) => write!(f, "Failed to read file: {}", err),
            BytefileError::Oversize(size) => {
                write!(f, "File is too big: {} bytes, max is {}", size, i32::MAX - 16)
            }
            BytefileError::HeaderInsane {
                string_table,
                global_area,
                publics,
            } => write!(
                f,
                "Header values too large: string_table={}, global_area={}, publics={}",
                string_table, global_area, publics
            ),
            BytefileError::Truncated { expected, actual } => write!(
                f,
                "File truncated: expected at least {} bytes, got {}",
                expected, actual
            ),
            BytefileError::StringOob { offset, table_size } => write!(
                f,
                "String offset out of bounds: pos={}, string_table_size={}",
                offset, table_size
            ),
            BytefileError::UnterminatedString { offset } => {
                write!(f, "String at offset {} is not zero-terminated", offset)
            }
            BytefileError::PublicOob { index, count } => write!(
                f,
                "Public symbol index out of bounds: {} (public_symbols_number: {})",
                index, count
            ),
            BytefileError::MainMissing { available } => {
                write!(f, "Required public symbol 'main' not found")?;
                if !available.is_empty() {
                    write!(f, "; available symbols: {}", available.join(", "))?;
                }
                Ok(())
            }
            BytefileError::EntryOutOfCode { offset, code_size } => write!(
                f,
                "'main' offset {} points outside code section (code size {})",
                offset, code_size
            ),
        }
    }
}

impl std::error::Error for BytefileError {}

impl From<std::io::Error> for BytefileError {
    fn from(err: std::io::Error) -> Self {
        BytefileError::Io(err)
    }
}

// Memory layout of the bytecode file
// +------------------------------------+
// |           File Header              |
// |------------------------------------|
// |  int32: string table size          |
// |  int32: global area size (words)   |
// |  int32: public symbols number P    |
// |  P x (int32 name, int32 offset)    |
// +------------------------------------+
// |           String Table             |
// |------------------------------------|
// |  e.g., "main\0string1\0"           |
// +------------------------------------+
// |           Code Region              |
// |------------------------------------|
// |  instruction stream to end of file |
// +------------------------------------+
pub struct Bytefile {
    string_table_size: u32,
    pub global_area_size: u32,
    public_symbols_number: u32,
    public_symbols: Vec<(u32, u32)>,
    string_table: Vec<u8>,
    pub code_section: Vec<u8>, // Kept raw for later interpretation
}

impl Bytefile {
    /// Read and parse a bytecode file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Bytefile, BytefileError> {
        let meta = fs::metadata(path.as_ref())?;
        if meta.len() > (i32::MAX - 16) as u64 {
            return Err(BytefileError::Oversize(meta.len()));
        }

        Self::parse(fs::read(path)?)
    }

    /// Parse a bytecode image into a Bytefile struct.
    /// Leaves the code section raw (as bytes) to be interpreted later,
    /// while all other sections are parsed and stored for easy access.
    pub fn parse(source: Vec<u8>) -> Result<Bytefile, BytefileError> {
        if source.len() < HEADER_SIZE {
            return Err(BytefileError::Truncated {
                expected: HEADER_SIZE,
                actual: source.len(),
            });
        }

        let word_at = |i: usize| u32::from_le_bytes(source[i..i + 4].try_into().unwrap());
        let string_table_size = word_at(0);
        let global_area_size = word_at(4);
        let public_symbols_number = word_at(8);

        if string_table_size > MAX_STRING_TABLE_SIZE
            || global_area_size > MAX_GLOBAL_AREA_SIZE
            || public_symbols_number > MAX_PUBLIC_SYMBOLS
        {
            return Err(BytefileError::HeaderInsane {
                string_table: string_table_size,
                global_area: global_area_size,
                publics: public_symbols_number,
            });
        }

        let publics_size = public_symbols_number as usize * 2 * 4;
        let data_size = publics_size + string_table_size as usize;
        if source.len() < HEADER_SIZE + data_size {
            return Err(BytefileError::Truncated {
                expected: HEADER_SIZE + data_size,
                actual: source.len(),
            });
        }

        let mut public_symbols = Vec::with_capacity(public_symbols_number as usize);
        for i in 0..public_symbols_number as usize {
            let name = word_at(HEADER_SIZE + i * 8);
            let offset = word_at(HEADER_SIZE + i * 8 + 4);
            public_symbols.push((name, offset));
        }

        let strings_start = HEADER_SIZE + publics_size;
        let code_start = strings_start + string_table_size as usize;
        let string_table = source[strings_start..code_start].to_vec();
        let code_section = source[code_start..].to_vec();

        Ok(Bytefile {
            string_table_size,
            global_area_size,
            public_symbols_number,
            public_symbols,
            string_table,
            code_section,
        })
    }

    /// Read the zero-terminated string starting at `offset` in the string
    /// table; the terminator is not included.
    pub fn string_at(&self, offset: usize) -> Result<&[u8], BytefileError> {
        if offset >= self.string_table_size as usize {
            return Err(BytefileError::StringOob {
                offset,
                table_size: self.string_table_size as usize,
            });
        }

        let slice = &self.string_table[offset..];
        let terminator = slice
            .iter()
            .position(|&b| b == 0)
            .ok_or(BytefileError::UnterminatedString { offset })?;

        Ok(&slice[..terminator])
    }

    pub fn public_name(&self, index: usize) -> Result<&[u8], BytefileError> {
        let (name_offset, _) = self.public_pair(index)?;
        self.string_at(name_offset as usize)
    }

    pub fn public_offset(&self, index: usize) -> Result<u32, BytefileError> {
        let (_, code_offset) = self.public_pair(index)?;
        Ok(code_offset)
    }

    fn public_pair(&self, index: usize) -> Result<(u32, u32), BytefileError> {
        self.public_symbols
            .get(index)
            .copied()
            .ok_or(BytefileError::PublicOob {
                index,
                count: self.public_symbols_number as usize,
            })
    }

    /// Find the code offset of the `main` public symbol.
    pub fn entry_point(&self) -> Result<usize, BytefileError> {
        for i in 0..self.public_symbols.len() {
            if self.public_name(i)? != b"main" {
                continue;
            }

            let offset = self.public_offset(i)? as usize;
            if offset >= self.code_section.len() {
                return Err(BytefileError::EntryOutOfCode {
                    offset,
                    code_size: self.code_section.len(),
                });
            }
            return Ok(offset);
        }

        // List a few symbols so a mislinked image is diagnosable.
        let available = self
            .public_symbols
            .iter()
            .take(10)
            .map(|&(name, _)| match self.string_at(name as usize) {
                Ok(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                Err(_) => format!("<bad name offset {}>", name),
            })
            .collect();

        Err(BytefileError::MainMissing { available })
    }

    /// Create a dummy Bytefile for testing purposes
    #[cfg(test)]
    pub fn new_dummy(global_area_size: u32, code_section: Vec<u8>) -> Self {
        Bytefile {
            string_table_size: 0,
            global_area_size,
            public_symbols_number: 0,
            public_symbols: vec![],
            string_table: vec![],
            code_section,
        }
    }

    /// Append a zero-terminated string to the table, returning its offset
    #[cfg(test)]
    pub fn put_string(&mut self, s: &str) -> u32 {
        let offset = self.string_table.len() as u32;
        self.string_table.extend_from_slice(s.as_bytes());
        self.string_table.push(0);
        self.string_table_size = self.string_table.len() as u32;
        offset
    }
}

impl Display for Bytefile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "--------- Bytefile Dump ----------")?;
        writeln!(f, " - String Table Size: {}", self.string_table_size)?;
        writeln!(f, " - Global Area Size: {}", self.global_area_size)?;
        writeln!(
            f,
            " - Public Symbol Table Size: {}",
            self.public_symbols_number
        )?;
        writeln!(f, " - Code Section Byte Size: {}", self.code_section.len())?;

        writeln!(f, " - Public symbols:")?;
        for (name, offset) in &self.public_symbols {
            let shown = self
                .string_at(*name as usize)
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .unwrap_or_else(|_| format!("<bad offset {}>", name));
            writeln!(f, "  - {}: {}", shown, offset)?;
        }

        writeln!(f, " - String table raw: {:?}", self.string_table)?;

        writeln!(f, " - Code Section:")?;
        for byte in &self.code_section {
            write!(f, "{:02X?}", byte)?;
        }

        write!(f, "\n-----------------------------")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_minimal_file() -> Result<(), Box<dyn std::error::Error>> {
        // ~ =>  xxd dump/test1.bc
        // 00000000: 0500 0000 0100 0000 0100 0000 0000 0000  ................
        // 00000010: 0000 0000 6d61 696e 0052 0200 0000 0000  ....main.R......
        // 00000020: 0000 1002 0000 0010 0300 0000 015a 0100  .............Z..
        // 00000030: 0000 4000 0000 0018 5a02 0000 005a 0400  ..@.....Z....Z..
        // 00000040: 0000 2000 0000 0071 16ff                 .. ....q..
        let data: Vec<u8> = vec![
            0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x6d, 0x61, 0x69, 0x6e, 0x00, 0x52, 0x02, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x02, 0x00, 0x00, 0x00, 0x10, 0x03, 0x00,
            0x00, 0x00, 0x01, 0x5a, 0x01, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x18,
            0x5a, 0x02, 0x00, 0x00, 0x00, 0x5a, 0x04, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00,
            0x00, 0x71, 0x16, 0xff,
        ];

        let bytefile = Bytefile::parse(data)?;

        assert_eq!(bytefile.string_table_size, 5);
        assert_eq!(bytefile.global_area_size, 1);
        assert_eq!(bytefile.public_symbols_number, 1);

        assert_eq!(bytefile.string_at(0)?, b"main");
        assert_eq!(bytefile.public_name(0)?, b"main");
        assert_eq!(bytefile.public_offset(0)?, 0);
        assert_eq!(bytefile.entry_point()?, 0);

        // Code starts right after "main\0": BEGIN 2 0 ...
        assert_eq!(bytefile.code_section[0], 0x52);

        Ok(())
    }

    #[test]
    fn load_from_disk() -> Result<(), Box<dyn std::error::Error>> {
        // Header only, empty everything: a degenerate but valid image.
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&[0u8; 12])?;

        let bytefile = Bytefile::load(file.path())?;
        assert_eq!(bytefile.global_area_size, 0);
        assert!(bytefile.code_section.is_empty());

        Ok(())
    }

    #[test]
    fn load_missing_file() {
        let result = Bytefile::load("/nonexistent/image.bc");
        assert!(matches!(result, Err(BytefileError::Io(_))));
    }

    #[test]
    fn reject_short_header() {
        let result = Bytefile::parse(vec![0x05, 0x00, 0x00]);
        assert!(matches!(
            result,
            Err(BytefileError::Truncated {
                expected: 12,
                actual: 3
            })
        ));
    }

    #[test]
    fn reject_truncated_sections() {
        // Claims a 100-byte string table but the file ends after the header.
        let mut data = vec![0u8; 12];
        data[0] = 100;
        let result = Bytefile::parse(data);
        assert!(matches!(result, Err(BytefileError::Truncated { .. })));
    }

    #[test]
    fn reject_insane_header() {
        let mut data = vec![0u8; 12];
        data[4..8].copy_from_slice(&(11 * 1024 * 1024u32).to_le_bytes());
        let result = Bytefile::parse(data);
        assert!(matches!(result, Err(BytefileError::HeaderInsane { .. })));
    }

    #[test]
    fn string_lookup_bounds() -> Result<(), Box<dyn std::error::Error>> {
        let mut bf = Bytefile::new_dummy(0, vec![]);
        let hello = bf.put_string("hello");

        assert_eq!(bf.string_at(hello as usize)?, b"hello");
        assert_eq!(bf.string_at(1)?, b"ello");
        assert!(matches!(
            bf.string_at(6),
            Err(BytefileError::StringOob {
                offset: 6,
                table_size: 6
            })
        ));

        Ok(())
    }

    #[test]
    fn public_lookup_bounds() {
        let bf = Bytefile::new_dummy(0, vec![]);
        assert!(matches!(
            bf.public_offset(0),
            Err(BytefileError::PublicOob { index: 0, count: 0 })
        ));
    }

    #[test]
    fn missing_main_lists_symbols() -> Result<(), Box<dyn std::error::Error>> {
        let mut bf = Bytefile::new_dummy(0, vec![0x16]);
        let name = bf.put_string("helper");
        bf.public_symbols.push((name, 0));
        bf.public_symbols_number = 1;

        match bf.entry_point() {
            Err(BytefileError::MainMissing { available }) => {
                assert_eq!(available, vec!["helper".to_string()]);
            }
            other => panic!("expected MainMissing, got {:?}", other.map(|_| ())),
        }

        Ok(())
    }

    #[test]
    fn entry_point_outside_code() -> Result<(), Box<dyn std::error::Error>> {
        let mut bf = Bytefile::new_dummy(0, vec![0x16]);
        let name = bf.put_string("main");
        bf.public_symbols.push((name, 5));
        bf.public_symbols_number = 1;

        assert!(matches!(
            bf.entry_point(),
            Err(BytefileError::EntryOutOfCode {
                offset: 5,
                code_size: 1
            })
        ));

        Ok(())
    }
}
