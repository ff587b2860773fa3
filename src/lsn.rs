//! LSN (Log Sequence Number) 관리
//!
//! LSN 형식: 상위 32비트/하위 32비트 16진수 (e.g. "16/B374D848")
//! WAL 스트림에서의 위치를 나타내며, 체크포인트와 영속 레코드의 기본 키로 사용됩니다.

use crate::error::{CdcError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// WAL 스트림 위치
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    /// LSN 인코딩 바이트 길이
    pub const ENCODED_LEN: usize = 8;

    pub fn new(value: u64) -> Self {
        Lsn(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// "X/Y" 형식 파싱
    pub fn parse(text: &str) -> Result<Self> {
        let (hi, lo) = text
            .trim()
            .split_once('/')
            .ok_or_else(|| CdcError::DecodeError(format!("Invalid LSN: {}", text)))?;

        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| CdcError::DecodeError(format!("Invalid LSN high word: {}", text)))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| CdcError::DecodeError(format!("Invalid LSN low word: {}", text)))?;

        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }

    /// 고정 길이 big-endian 바이트로 인코딩 (오프셋 값 저장용)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(Self::ENCODED_LEN);
        // Vec<u8>에 대한 쓰기는 실패하지 않음
        let _ = buffer.write_u64::<BigEndian>(self.0);
        buffer
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(CdcError::DecodeError(format!(
                "LSN needs {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        Ok(Lsn(bytes.read_u64::<BigEndian>()?))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        Lsn::parse(s)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_parse() {
        let lsn = Lsn::parse("16/B374D848").unwrap();
        assert_eq!(lsn.as_u64(), (0x16u64 << 32) | 0xB374D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
    }

    #[test]
    fn test_lsn_parse_invalid() {
        assert!(Lsn::parse("16B374D848").is_err());
        assert!(Lsn::parse("zz/1").is_err());
    }

    #[test]
    fn test_lsn_ordering() {
        let a = Lsn::parse("0/16B3740").unwrap();
        let b = Lsn::parse("1/0").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_lsn_bytes() {
        let lsn = Lsn::new(0x0102_0304_0506_0708);
        let bytes = lsn.to_bytes();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(Lsn::from_bytes(&bytes).unwrap(), lsn);
        assert!(Lsn::from_bytes(&bytes[..3]).is_err());
    }
}
