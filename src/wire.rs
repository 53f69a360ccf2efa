use std::io::{BufRead, Read, Result, Write};

pub trait ReadExt {
    fn read_char(&mut self) -> Result<char>;
    fn read_u16_be(&mut self) -> Result<u16>;
    fn read_u32_be(&mut self) -> Result<u32>;
    fn read_bytes(&mut self, len: usize, data: &mut Vec<u8>) -> Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_char(&mut self) -> Result<char> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0] as char)
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_bytes(&mut self, len: usize, data: &mut Vec<u8>) -> Result<()> {
        data.resize(len, 0u8);
        self.read_exact(data)
    }
}

pub trait BufReadExt {
    fn read_zstring(&mut self, buffer: &mut Vec<u8>) -> Result<String>;
    fn read_zstring_anglestripped(&mut self, buffer: &mut Vec<u8>) -> Result<String>;
}

fn read_zbytes<'a, R: BufRead + ?Sized>(reader: &mut R, buffer: &'a mut Vec<u8>) -> Result<&'a [u8]> {
    buffer.clear();
    reader.read_until(b'\0', buffer)?;
    if buffer.last() == Some(&0) {
        buffer.pop();
    }
    Ok(&buffer[..])
}

impl<T: BufRead> BufReadExt for T {
    fn read_zstring(&mut self, buffer: &mut Vec<u8>) -> Result<String> {
        Ok(String::from_utf8_lossy(read_zbytes(self, buffer)?).into_owned())
    }

    fn read_zstring_anglestripped(&mut self, buffer: &mut Vec<u8>) -> Result<String> {
        let s = read_zbytes(self, buffer)?;
        let s = match s {
            [b'<', inner @ .., b'>'] => inner,
            _ => s,
        };
        Ok(String::from_utf8_lossy(s).into_owned())
    }
}

pub fn write_packet(writer: &mut impl Write, cmd: u8, payload: &[u8]) -> Result<()> {
    let len = (payload.len() + 1) as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&[cmd])?;
    writer.write_all(payload)
}
