// Message framing - opaque bodies behind a fixed 16-byte header, no I/O
use std::os::fd::OwnedFd;

/// Little-endian marker, the only byte order this framing speaks.
pub const ENDIAN_LITTLE: u8 = b'l';
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;

/// Largest body any peer may declare, regardless of configured limits.
pub const MAXIMUM_MESSAGE_LENGTH: usize = 128 * 1024 * 1024;
/// Largest fd count any peer may declare, regardless of configured limits.
pub const MAXIMUM_MESSAGE_UNIX_FDS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(MessageKind::MethodCall),
            2 => Some(MessageKind::MethodReturn),
            3 => Some(MessageKind::Error),
            4 => Some(MessageKind::Signal),
            _ => None,
        }
    }
}

// Frame header (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageKind,
    pub flags: u8,
    pub body_len: u32,
    pub serial: u32,
    pub unix_fds: u32,
}

/// Why a header was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    BadEndianness(u8),
    BadVersion(u8),
    BadKind(u8),
    ZeroSerial,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = ENDIAN_LITTLE;
        bytes[1] = self.kind as u8;
        bytes[2] = self.flags;
        bytes[3] = PROTOCOL_VERSION;
        bytes[4..8].copy_from_slice(&self.body_len.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.serial.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.unix_fds.to_le_bytes());
        bytes
    }

    /// `Ok(None)` when fewer than [`HEADER_LEN`] bytes are available.
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>, HeaderError> {
        if bytes.len() < HEADER_LEN {
            return Ok(None);
        }
        if bytes[0] != ENDIAN_LITTLE {
            return Err(HeaderError::BadEndianness(bytes[0]));
        }
        if bytes[3] != PROTOCOL_VERSION {
            return Err(HeaderError::BadVersion(bytes[3]));
        }
        let kind = MessageKind::from_u8(bytes[1]).ok_or(HeaderError::BadKind(bytes[1]))?;
        let serial = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if serial == 0 {
            return Err(HeaderError::ZeroSerial);
        }

        Ok(Some(FrameHeader {
            kind,
            flags: bytes[2],
            body_len: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            serial,
            unix_fds: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }))
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }
}

// Complete message: header fields, opaque body, attached descriptors
#[derive(Debug)]
pub struct Message {
    kind: MessageKind,
    flags: u8,
    serial: u32,
    body: Vec<u8>,
    unix_fds: Vec<OwnedFd>,
}

impl Message {
    pub fn new(kind: MessageKind, body: impl Into<Vec<u8>>) -> Self {
        Message {
            kind,
            flags: 0,
            serial: 0,
            body: body.into(),
            unix_fds: Vec::new(),
        }
    }

    pub fn method_call(body: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::MethodCall, body)
    }

    pub fn signal(body: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Signal, body)
    }

    /// Rebuilds a message from a parsed header; used by loaders.
    pub fn from_frame(header: FrameHeader, body: Vec<u8>, unix_fds: Vec<OwnedFd>) -> Self {
        Message {
            kind: header.kind,
            flags: header.flags,
            serial: header.serial,
            body,
            unix_fds,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn attach_unix_fd(&mut self, fd: OwnedFd) {
        self.unix_fds.push(fd);
    }

    pub fn unix_fds(&self) -> &[OwnedFd] {
        &self.unix_fds
    }

    pub fn take_unix_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.unix_fds)
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            kind: self.kind,
            flags: self.flags,
            body_len: self.body.len() as u32,
            serial: self.serial,
            unix_fds: self.unix_fds.len() as u32,
        }
    }

    /// Header and body as they go on the wire.
    pub fn network_data(&self) -> ([u8; HEADER_LEN], &[u8]) {
        (self.header().to_bytes(), &self.body)
    }

    /// Bytes this message occupies on the wire and in live-message accounting.
    pub fn size(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.extend_from_slice(&self.header().to_bytes());
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let mut msg = Message::signal(b"hello".to_vec());
        msg.set_serial(0x0102_0304);
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        assert_eq!(&bytes[..4], &[b'l', 4, 0, 1]);
        assert_eq!(&bytes[4..8], &5u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &[4, 3, 2, 1]);
        assert_eq!(&bytes[16..], b"hello");
    }

    #[test]
    fn short_header_is_incomplete_not_an_error() {
        assert_eq!(FrameHeader::from_bytes(&[b'l', 1, 0]), Ok(None));
    }

    #[test]
    fn bad_headers_are_reported() {
        let mut msg = Message::method_call(Vec::new());
        msg.set_serial(1);
        let good = msg.header().to_bytes();

        let mut bad = good;
        bad[0] = b'B';
        assert_eq!(FrameHeader::from_bytes(&bad), Err(HeaderError::BadEndianness(b'B')));

        let mut bad = good;
        bad[3] = 2;
        assert_eq!(FrameHeader::from_bytes(&bad), Err(HeaderError::BadVersion(2)));

        let mut bad = good;
        bad[1] = 0;
        assert_eq!(FrameHeader::from_bytes(&bad), Err(HeaderError::BadKind(0)));

        let mut bad = good;
        bad[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(FrameHeader::from_bytes(&bad), Err(HeaderError::ZeroSerial));
    }
}
