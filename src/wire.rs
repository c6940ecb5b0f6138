//! 와이어 코덱
//!
//! 모든 정수는 big-endian. 패킷 공통 헤더는
//! `stream_id(4) | kind(1)` 5바이트.
//!
//! - DATA/FINAL 페이로드: `chunk_index(2)` + 원시 청크 바이트
//! - ACK 페이로드: `high_mark(2)` + 누락 구간의 역순 run-length 인코딩
//!
//! ACK run 인코딩은 high_mark 바로 아래 인덱스부터 0까지 내려가며
//! 수신/누락 run을 한 바이트씩 기록한다. 최상위 비트가 켜지면 누락 run,
//! 꺼지면 수신 run이며 `run_len = (byte & 0x7F) + 1`.
//! 마지막 구간 아래의 수신 run은 기록하지 않는다 (암묵적 수신).
//! 길이 128을 넘는 run은 연속 바이트로 분할 기록한다.

use bytes::Bytes;

use crate::range::RangeSet;
use crate::{ChunkIndex, Error, Result, StreamId, HEADER_SIZE, MAX_ACK_RUN};

/// 패킷 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Selective ACK
    Ack = 0,

    /// 데이터 청크
    Data = 1,

    /// 마지막 데이터 청크
    Final = 2,
}

impl PacketKind {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(PacketKind::Ack),
            1 => Ok(PacketKind::Data),
            2 => Ok(PacketKind::Final),
            kind => Err(Error::UnknownKind { kind }),
        }
    }
}

/// 디코드된 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ack {
        stream_id: StreamId,
        /// 관측된 최고 청크 인덱스
        high_mark: ChunkIndex,
        /// high_mark 아래의 누락 구간
        missing: RangeSet,
    },
    Data {
        stream_id: StreamId,
        index: ChunkIndex,
        data: Bytes,
        is_final: bool,
    },
}

impl Packet {
    /// 패킷을 바이트로 직렬화
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Ack {
                stream_id,
                high_mark,
                missing,
            } => {
                let mut buf = Vec::with_capacity(HEADER_SIZE + 2 + missing.len() * 2);
                buf.extend_from_slice(&stream_id.to_be_bytes());
                buf.push(PacketKind::Ack as u8);
                buf.extend_from_slice(&high_mark.to_be_bytes());
                encode_runs(*high_mark, missing, &mut buf);
                buf
            }
            Packet::Data {
                stream_id,
                index,
                data,
                is_final,
            } => {
                let kind = if *is_final {
                    PacketKind::Final
                } else {
                    PacketKind::Data
                };
                let mut buf = Vec::with_capacity(HEADER_SIZE + 2 + data.len());
                buf.extend_from_slice(&stream_id.to_be_bytes());
                buf.push(kind as u8);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
        }
    }

    /// 바이트에서 패킷 역직렬화
    ///
    /// 잘못된 입력은 패닉/범위 초과 없이 에러로 거부한다.
    pub fn decode(raw: &[u8]) -> Result<Packet> {
        if raw.len() < HEADER_SIZE + 2 {
            return Err(Error::TruncatedPacket { len: raw.len() });
        }

        let stream_id = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let kind = PacketKind::from_byte(raw[4])?;
        let payload = &raw[HEADER_SIZE..];

        match kind {
            PacketKind::Ack => {
                let high_mark = u16::from_be_bytes([payload[0], payload[1]]);
                let missing = decode_runs(high_mark, &payload[2..])?;
                Ok(Packet::Ack {
                    stream_id,
                    high_mark,
                    missing,
                })
            }
            PacketKind::Data | PacketKind::Final => {
                let index = u16::from_be_bytes([payload[0], payload[1]]);
                let data = Bytes::copy_from_slice(&payload[2..]);
                Ok(Packet::Data {
                    stream_id,
                    index,
                    data,
                    is_final: kind == PacketKind::Final,
                })
            }
        }
    }
}

/// run 한 개를 컨트롤 바이트 하나로 기록
///
/// 한 바이트는 run 길이 1~128만 표현 가능하므로 그 밖의 길이는 거부한다.
/// 긴 run의 분할은 호출자 몫이다.
pub fn push_run(buf: &mut Vec<u8>, is_missing: bool, len: usize) -> Result<()> {
    if len == 0 || len > MAX_ACK_RUN {
        return Err(Error::AckRunTooLong { len });
    }
    let byte = (len - 1) as u8;
    buf.push(if is_missing { 0x80 | byte } else { byte });
    Ok(())
}

/// run을 128 단위로 분할하여 기록
fn push_split_run(buf: &mut Vec<u8>, is_missing: bool, mut len: usize) {
    while len > MAX_ACK_RUN {
        buf.push(if is_missing { 0x80 | 0x7F } else { 0x7F });
        len -= MAX_ACK_RUN;
    }
    if len > 0 {
        // len <= 128이므로 실패하지 않음
        let _ = push_run(buf, is_missing, len);
    }
}

/// 누락 구간을 역순 run-length로 인코딩
///
/// 커서는 `high_mark - 1`에서 출발한다. high_mark 자체는 수신이 확인된
/// 인덱스이므로 run에 포함하지 않는다.
fn encode_runs(high_mark: ChunkIndex, missing: &RangeSet, buf: &mut Vec<u8>) {
    let mut cursor = high_mark as i32 - 1;

    for &(lo, hi) in missing.as_slice().iter().rev() {
        let present = cursor - hi as i32;
        if present > 0 {
            push_split_run(buf, false, present as usize);
        }
        push_split_run(buf, true, (hi - lo) as usize + 1);
        cursor = lo as i32 - 1;

        if cursor < 0 {
            break;
        }
    }
}

/// run-length 바이트열을 누락 구간 집합으로 복원
fn decode_runs(high_mark: ChunkIndex, runs: &[u8]) -> Result<RangeSet> {
    let mut missing = RangeSet::new();
    let mut cursor = high_mark as i32 - 1;

    for &byte in runs {
        let run = ((byte & 0x7F) + 1) as u32;
        if cursor - (run as i32) < -1 {
            return Err(Error::AckRunOverrun { cursor, run });
        }
        if byte & 0x80 != 0 {
            let lo = (cursor - run as i32 + 1) as u16;
            missing.insert(lo, cursor as u16);
        }
        cursor -= run as i32;
    }

    Ok(missing)
}
