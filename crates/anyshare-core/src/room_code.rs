//! 房间码
//!
//! 格式: `WORD-NNNN`（一个或多个大写字母、连字符、正好 4 位数字），例如 `SWIFT-7284`。
//! 在发起任何协商之前都要先在本地校验。

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static ROOM_CODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]+-\d{4}$").unwrap());

/// 生成房间码用的单词表
const WORDS: &[&str] = &[
    "SWIFT", "QUICK", "FLASH", "RAPID", "BLAZE", "SPARK", "BOLT", "DASH", "ZOOM", "PULSE",
    "WAVE", "STORM", "FIRE", "WIND", "FROST",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid room code: {0:?} (expected WORD-NNNN)")]
pub struct InvalidRoomCode(pub String);

/// 已校验的房间码
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// 校验并构造房间码
    pub fn parse(code: &str) -> Result<Self, InvalidRoomCode> {
        if is_valid_room_code(code) {
            Ok(Self(code.to_string()))
        } else {
            Err(InvalidRoomCode(code.to_string()))
        }
    }

    /// 随机生成一个房间码
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let word = WORDS[rng.gen_range(0..WORDS.len())];
        let number: u16 = rng.gen_range(0..10_000);
        Self(format!("{word}-{number:04}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 仅校验格式
pub fn is_valid_room_code(code: &str) -> bool {
    ROOM_CODE_PATTERN.is_match(code)
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = InvalidRoomCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = InvalidRoomCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}
