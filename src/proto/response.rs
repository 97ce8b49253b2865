use super::request::OpCode;
use crate::{KeeperState, Stat, WatchedEvent, WatchedEventType};
use byteorder::{BigEndian, ReadBytesExt};
use std::convert::TryFrom;
use std::io::{self, Read};

#[derive(Debug)]
pub(crate) enum Response {
    Connect {
        protocol_version: i32,
        timeout: i32,
        session_id: i64,
        password: Vec<u8>,
        read_only: bool,
    },
    Children {
        children: Vec<String>,
        stat: Stat,
    },
    Empty,
    String(String),
}

pub(crate) trait ReadFrom: Sized {
    fn read_from<R: Read>(read: &mut R) -> io::Result<Self>;
}

impl ReadFrom for Stat {
    fn read_from<R: Read>(read: &mut R) -> io::Result<Stat> {
        Ok(Stat {
            czxid: read.read_i64::<BigEndian>()?,
            mzxid: read.read_i64::<BigEndian>()?,
            ctime: read.read_i64::<BigEndian>()?,
            mtime: read.read_i64::<BigEndian>()?,
            version: read.read_i32::<BigEndian>()?,
            cversion: read.read_i32::<BigEndian>()?,
            aversion: read.read_i32::<BigEndian>()?,
            ephemeral_owner: read.read_i64::<BigEndian>()?,
            data_length: read.read_i32::<BigEndian>()?,
            num_children: read.read_i32::<BigEndian>()?,
            pzxid: read.read_i64::<BigEndian>()?,
        })
    }
}

impl ReadFrom for WatchedEvent {
    fn read_from<R: Read>(read: &mut R) -> io::Result<WatchedEvent> {
        let wtype = read.read_i32::<BigEndian>()?;
        let state = read.read_i32::<BigEndian>()?;
        let path = read.read_optional_string()?;
        Ok(WatchedEvent {
            event_type: WatchedEventType::try_from(wtype).map_err(invalid_data)?,
            keeper_state: KeeperState::try_from(state).map_err(invalid_data)?,
            // the server sends an empty path for session events
            path: path.filter(|p| !p.is_empty()),
        })
    }
}

fn invalid_data(e: failure::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

pub(crate) trait BufferReader: Read {
    fn read_buffer(&mut self) -> io::Result<Option<Vec<u8>>>;
}

impl<R: Read> BufferReader for R {
    fn read_buffer(&mut self) -> io::Result<Option<Vec<u8>>> {
        let len = self.read_i32::<BigEndian>()?;
        if len < 0 {
            return Ok(None);
        }
        let mut buf = vec![0; len as usize];
        self.read_exact(&mut buf)?;
        Ok(Some(buf))
    }
}

trait StringReader: Read {
    fn read_optional_string(&mut self) -> io::Result<Option<String>>;

    fn read_string(&mut self) -> io::Result<String> {
        Ok(self.read_optional_string()?.unwrap_or_default())
    }
}

impl<R: Read> StringReader for R {
    fn read_optional_string(&mut self) -> io::Result<Option<String>> {
        match self.read_buffer()? {
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

impl Response {
    pub(super) fn parse(opcode: OpCode, buf: &[u8]) -> Result<Self, failure::Error> {
        let mut reader = buf;
        Ok(match opcode {
            OpCode::CreateSession => Response::Connect {
                protocol_version: reader.read_i32::<BigEndian>()?,
                timeout: reader.read_i32::<BigEndian>()?,
                session_id: reader.read_i64::<BigEndian>()?,
                password: reader.read_buffer()?.unwrap_or_default(),
                // servers before 3.4 do not send the read-only flag
                read_only: reader.read_u8().map(|b| b != 0).unwrap_or(false),
            },
            OpCode::GetChildren2 => {
                let n = reader.read_i32::<BigEndian>()?;
                // every name takes at least its 4-byte length prefix
                let room = reader.len() as i32 / 4;
                let mut children = Vec::with_capacity(n.clamp(0, room) as usize);
                for _ in 0..n {
                    children.push(reader.read_string()?);
                }
                Response::Children {
                    children,
                    stat: Stat::read_from(&mut reader)?,
                }
            }
            OpCode::Create => Response::String(reader.read_string()?),
            OpCode::Delete | OpCode::SetWatches | OpCode::CloseSession | OpCode::Ping => {
                Response::Empty
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn string(buf: &mut Vec<u8>, s: &str) {
        buf.write_i32::<BigEndian>(s.len() as i32).unwrap();
        buf.extend_from_slice(s.as_bytes());
    }

    fn stat(buf: &mut Vec<u8>, num_children: i32) {
        for _ in 0..4 {
            buf.write_i64::<BigEndian>(1).unwrap();
        }
        for _ in 0..3 {
            buf.write_i32::<BigEndian>(0).unwrap();
        }
        buf.write_i64::<BigEndian>(0).unwrap();
        buf.write_i32::<BigEndian>(0).unwrap();
        buf.write_i32::<BigEndian>(num_children).unwrap();
        buf.write_i64::<BigEndian>(9).unwrap();
    }

    #[test]
    fn parses_children_reply() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(2).unwrap();
        string(&mut buf, "c1");
        string(&mut buf, "c2");
        stat(&mut buf, 2);

        match Response::parse(OpCode::GetChildren2, &buf).unwrap() {
            Response::Children { children, stat } => {
                assert_eq!(children, vec!["c1", "c2"]);
                assert_eq!(stat.num_children, 2);
                assert_eq!(stat.pzxid, 9);
            }
            r => panic!("unexpected response {:?}", r),
        }
    }

    #[test]
    fn oversized_child_count_fails_without_allocating_it() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(i32::MAX).unwrap();
        string(&mut buf, "c1");
        assert!(Response::parse(OpCode::GetChildren2, &buf).is_err());
    }

    #[test]
    fn parses_session_notification() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(-1).unwrap();
        buf.write_i32::<BigEndian>(3).unwrap();
        buf.write_i32::<BigEndian>(-1).unwrap();
        let e = WatchedEvent::read_from(&mut &buf[..]).unwrap();
        assert_eq!(e, WatchedEvent::session(KeeperState::SyncConnected));
    }

    #[test]
    fn parses_children_changed_notification() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(4).unwrap();
        buf.write_i32::<BigEndian>(3).unwrap();
        string(&mut buf, "/zk-book");
        let e = WatchedEvent::read_from(&mut &buf[..]).unwrap();
        assert_eq!(
            e,
            WatchedEvent::node(WatchedEventType::NodeChildrenChanged, "/zk-book")
        );
    }

    #[test]
    fn parses_connect_reply_without_read_only_flag() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(0).unwrap();
        buf.write_i32::<BigEndian>(4000).unwrap();
        buf.write_i64::<BigEndian>(0x42).unwrap();
        buf.write_i32::<BigEndian>(2).unwrap();
        buf.extend_from_slice(&[7, 7]);
        match Response::parse(OpCode::CreateSession, &buf).unwrap() {
            Response::Connect {
                timeout,
                session_id,
                password,
                read_only,
                ..
            } => {
                assert_eq!(timeout, 4000);
                assert_eq!(session_id, 0x42);
                assert_eq!(password, vec![7, 7]);
                assert!(!read_only);
            }
            r => panic!("unexpected response {:?}", r),
        }
    }

    #[test]
    fn rejects_unknown_event_type() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(99).unwrap();
        buf.write_i32::<BigEndian>(3).unwrap();
        string(&mut buf, "/x");
        assert!(WatchedEvent::read_from(&mut &buf[..]).is_err());
    }
}
