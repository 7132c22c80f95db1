//! Payload of FILE_TRANSFER_PROTOCOL messages.

use bytes::{Buf, BufMut};

use crate::error::ProtoError;

pub const FTP_PAYLOAD_LEN: usize = 251;
pub const FTP_HEADER_LEN: usize = 12;
pub const FTP_MAX_DATA: usize = FTP_PAYLOAD_LEN - FTP_HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpOpcode {
    None,
    TerminateSession,
    ResetSessions,
    ListDirectory,
    OpenFileRo,
    ReadFile,
    CreateFile,
    WriteFile,
    RemoveFile,
    CreateDirectory,
    RemoveDirectory,
    OpenFileWo,
    TruncateFile,
    Rename,
    CalcFileCrc32,
    BurstReadFile,
    Ack,
    Nak,
    Other(u8),
}

impl From<u8> for FtpOpcode {
    fn from(v: u8) -> Self {
        match v {
            0 => FtpOpcode::None,
            1 => FtpOpcode::TerminateSession,
            2 => FtpOpcode::ResetSessions,
            3 => FtpOpcode::ListDirectory,
            4 => FtpOpcode::OpenFileRo,
            5 => FtpOpcode::ReadFile,
            6 => FtpOpcode::CreateFile,
            7 => FtpOpcode::WriteFile,
            8 => FtpOpcode::RemoveFile,
            9 => FtpOpcode::CreateDirectory,
            10 => FtpOpcode::RemoveDirectory,
            11 => FtpOpcode::OpenFileWo,
            12 => FtpOpcode::TruncateFile,
            13 => FtpOpcode::Rename,
            14 => FtpOpcode::CalcFileCrc32,
            15 => FtpOpcode::BurstReadFile,
            128 => FtpOpcode::Ack,
            129 => FtpOpcode::Nak,
            other => FtpOpcode::Other(other),
        }
    }
}

impl From<FtpOpcode> for u8 {
    fn from(op: FtpOpcode) -> u8 {
        match op {
            FtpOpcode::None => 0,
            FtpOpcode::TerminateSession => 1,
            FtpOpcode::ResetSessions => 2,
            FtpOpcode::ListDirectory => 3,
            FtpOpcode::OpenFileRo => 4,
            FtpOpcode::ReadFile => 5,
            FtpOpcode::CreateFile => 6,
            FtpOpcode::WriteFile => 7,
            FtpOpcode::RemoveFile => 8,
            FtpOpcode::CreateDirectory => 9,
            FtpOpcode::RemoveDirectory => 10,
            FtpOpcode::OpenFileWo => 11,
            FtpOpcode::TruncateFile => 12,
            FtpOpcode::Rename => 13,
            FtpOpcode::CalcFileCrc32 => 14,
            FtpOpcode::BurstReadFile => 15,
            FtpOpcode::Ack => 128,
            FtpOpcode::Nak => 129,
            FtpOpcode::Other(v) => v,
        }
    }
}

/// First data byte of a NAK reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FtpNak {
    Fail = 1,
    FailErrno = 2,
    InvalidDataSize = 3,
    InvalidSession = 4,
    NoSessionsAvailable = 5,
    Eof = 6,
    UnknownCommand = 7,
    FileExists = 8,
    FileProtected = 9,
    FileNotFound = 10,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpPayload {
    pub seq: u16,
    pub session: u8,
    pub opcode: FtpOpcode,
    pub size: u8,
    pub req_opcode: FtpOpcode,
    pub burst_complete: u8,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl FtpPayload {
    pub fn reply(request: &FtpPayload, session: u8, opcode: FtpOpcode, data: Vec<u8>) -> Self {
        Self {
            seq: request.seq,
            session,
            opcode,
            size: data.len() as u8,
            req_opcode: request.opcode,
            burst_complete: 0,
            offset: 0,
            data,
        }
    }

    pub fn ack(request: &FtpPayload, session: u8) -> Self {
        Self::reply(request, session, FtpOpcode::Ack, Vec::new())
    }

    pub fn nak(request: &FtpPayload, session: u8, code: FtpNak) -> Self {
        Self::reply(request, session, FtpOpcode::Nak, vec![code as u8])
    }

    /// `size` bytes of `data`, clamped to what the frame actually carries.
    pub fn body(&self) -> &[u8] {
        &self.data[..(self.size as usize).min(self.data.len())]
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtoError> {
        if raw.len() < FTP_HEADER_LEN {
            return Err(ProtoError::FtpTooShort(raw.len()));
        }
        let mut b = raw;
        let seq = b.get_u16_le();
        let session = b.get_u8();
        let opcode = FtpOpcode::from(b.get_u8());
        let size = b.get_u8();
        let req_opcode = FtpOpcode::from(b.get_u8());
        let burst_complete = b.get_u8();
        b.advance(1);
        let offset = b.get_u32_le();
        let data = b[..b.len().min(FTP_MAX_DATA)].to_vec();
        Ok(Self { seq, session, opcode, size, req_opcode, burst_complete, offset, data })
    }

    pub fn encode(&self) -> [u8; FTP_PAYLOAD_LEN] {
        let mut out = [0u8; FTP_PAYLOAD_LEN];
        let mut b = &mut out[..];
        b.put_u16_le(self.seq);
        b.put_u8(self.session);
        b.put_u8(self.opcode.into());
        b.put_u8(self.size);
        b.put_u8(self.req_opcode.into());
        b.put_u8(self.burst_complete);
        b.put_u8(0);
        b.put_u32_le(self.offset);
        let n = self.data.len().min(FTP_MAX_DATA);
        b.put_slice(&self.data[..n]);
        out
    }
}
