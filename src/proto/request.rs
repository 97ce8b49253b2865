use crate::{Acl, CreateMode};
use byteorder::{BigEndian, WriteBytesExt};
use std::borrow::Cow;
use std::io::{self, Write};

#[derive(Debug)]
pub(crate) enum Request {
    Connect {
        protocol_version: i32,
        last_zxid_seen: i64,
        timeout: i32,
        session_id: i64,
        passwd: Vec<u8>,
        read_only: bool,
    },
    Create {
        path: String,
        data: Cow<'static, [u8]>,
        acl: Cow<'static, [Acl]>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: i32,
    },
    GetChildren {
        path: String,
        watch: bool,
    },
    SetWatches {
        relative_zxid: i64,
        data: Vec<String>,
        exist: Vec<String>,
        child: Vec<String>,
    },
    CloseSession,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(i32)]
pub(crate) enum OpCode {
    Create = 1,
    Delete = 2,
    Ping = 11,
    GetChildren2 = 12,
    SetWatches = 101,
    CreateSession = -10,
    CloseSession = -11,
}

/// Reserved xids the server uses for traffic that does not answer a numbered request.
pub(crate) mod xid {
    pub(crate) const NOTIFICATION: i32 = -1;
    pub(crate) const PING: i32 = -2;
    pub(crate) const SET_WATCHES: i32 = -8;
}

pub(crate) trait WriteTo {
    fn write_to<W: Write>(&self, writer: W) -> io::Result<()>;
}

impl WriteTo for Acl {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.perms.code())?;
        self.scheme.write_to(&mut writer)?;
        self.id.write_to(writer)
    }
}

impl WriteTo for String {
    fn write_to<W: Write>(&self, writer: W) -> io::Result<()> {
        self.as_str().write_to(writer)
    }
}

impl WriteTo for str {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_i32::<BigEndian>(self.len() as i32)?;
        writer.write_all(self.as_ref())
    }
}

impl WriteTo for [u8] {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_i32::<BigEndian>(self.len() as i32)?;
        writer.write_all(self)
    }
}

fn write_list<W, T>(mut writer: W, ts: &[T]) -> io::Result<()>
where
    T: WriteTo,
    W: Write,
{
    writer.write_i32::<BigEndian>(ts.len() as i32)?;
    for elem in ts {
        elem.write_to(&mut writer)?;
    }
    Ok(())
}

impl Request {
    /// Write the opcode-specific payload (everything after the request header).
    pub(super) fn serialize_into(&self, buffer: &mut Vec<u8>) -> Result<(), io::Error> {
        match *self {
            Request::Connect {
                protocol_version,
                last_zxid_seen,
                timeout,
                session_id,
                ref passwd,
                read_only,
            } => {
                buffer.write_i32::<BigEndian>(protocol_version)?;
                buffer.write_i64::<BigEndian>(last_zxid_seen)?;
                buffer.write_i32::<BigEndian>(timeout)?;
                buffer.write_i64::<BigEndian>(session_id)?;
                passwd[..].write_to(&mut *buffer)?;
                buffer.write_u8(read_only as u8)?;
            }
            Request::Create {
                ref path,
                ref data,
                ref acl,
                mode,
            } => {
                path.write_to(&mut *buffer)?;
                data[..].write_to(&mut *buffer)?;
                write_list(&mut *buffer, acl)?;
                buffer.write_i32::<BigEndian>(mode as i32)?;
            }
            Request::Delete { ref path, version } => {
                path.write_to(&mut *buffer)?;
                buffer.write_i32::<BigEndian>(version)?;
            }
            Request::GetChildren { ref path, watch } => {
                path.write_to(&mut *buffer)?;
                buffer.write_u8(watch as u8)?;
            }
            Request::SetWatches {
                relative_zxid,
                ref data,
                ref exist,
                ref child,
            } => {
                buffer.write_i64::<BigEndian>(relative_zxid)?;
                write_list(&mut *buffer, data)?;
                write_list(&mut *buffer, exist)?;
                write_list(&mut *buffer, child)?;
            }
            Request::CloseSession => {}
        }
        Ok(())
    }

    pub(crate) fn opcode(&self) -> OpCode {
        match *self {
            Request::Connect { .. } => OpCode::CreateSession,
            Request::Create { .. } => OpCode::Create,
            Request::Delete { .. } => OpCode::Delete,
            Request::GetChildren { .. } => OpCode::GetChildren2,
            Request::SetWatches { .. } => OpCode::SetWatches,
            Request::CloseSession => OpCode::CloseSession,
        }
    }

    /// Build a complete length-prefixed frame for this request.
    ///
    /// The handshake carries no request header; every other request is prefixed with its xid and
    /// opcode.
    pub(crate) fn frame(&self, xid: i32) -> Result<Vec<u8>, io::Error> {
        let mut buffer = Vec::new();
        // dummy length
        buffer.write_i32::<BigEndian>(0)?;
        if let Request::Connect { .. } = *self {
        } else {
            buffer.write_i32::<BigEndian>(xid)?;
            buffer.write_i32::<BigEndian>(self.opcode() as i32)?;
        }
        self.serialize_into(&mut buffer)?;
        // set true length
        let written = buffer.len() - 4;
        let mut length = &mut buffer[..4];
        length.write_i32::<BigEndian>(written as i32)?;
        Ok(buffer)
    }
}

/// The fixed-size frame used for heartbeats.
pub(crate) fn ping_frame() -> Vec<u8> {
    let mut buffer = Vec::with_capacity(12);
    buffer.extend_from_slice(&8i32.to_be_bytes());
    buffer.extend_from_slice(&xid::PING.to_be_bytes());
    buffer.extend_from_slice(&(OpCode::Ping as i32).to_be_bytes());
    buffer
}
