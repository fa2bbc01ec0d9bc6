// src/bus/serial.rs - Serial transport with length-prefixed, CRC checked frames
//
// Frame layout: [len: u16 LE][node: u8][body][crc16: u16 LE]
// `len` counts the node byte plus the body. The CRC covers everything before it.
use super::{NodeId, Transport, TransportError};
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;

/// CRC-16-CCITT calculation (XMODEM variant)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Encode one frame addressed to (or sent from) `node`.
pub fn encode_frame(node: NodeId, body: &[u8], max_frame_len: usize) -> Result<Vec<u8>, TransportError> {
    let total = HEADER_LEN + body.len() + CRC_LEN;
    if total > max_frame_len {
        return Err(TransportError::FrameTooLarge { len: total, max: max_frame_len });
    }
    let len = (body.len() + 1) as u16;
    let mut packet = Vec::with_capacity(total);
    packet.extend_from_slice(&len.to_le_bytes());
    packet.push(node.as_u8());
    packet.extend_from_slice(body);
    let crc = crc16(&packet);
    packet.extend_from_slice(&crc.to_le_bytes());
    Ok(packet)
}

/// Incremental decoder for the byte stream coming off the port.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self { buffer: Vec::new(), max_frame_len }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// A frame that fails validation is consumed before the error is returned, so
    /// the caller can keep decoding.
    pub fn next_frame(&mut self) -> Result<Option<(NodeId, Vec<u8>)>, TransportError> {
        if self.buffer.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if len == 0 || 2 + len + CRC_LEN > self.max_frame_len {
            // Length field is garbage; drop everything buffered and resync on the next read.
            let dropped = self.buffer.len();
            self.buffer.clear();
            return Err(TransportError::Malformed(format!(
                "invalid length {} (dropped {} bytes)",
                len, dropped
            )));
        }
        let total = 2 + len + CRC_LEN;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let packet: Vec<u8> = self.buffer.drain(..total).collect();
        let expected = crc16(&packet[..total - CRC_LEN]);
        let actual = u16::from_le_bytes([packet[total - 2], packet[total - 1]]);
        if expected != actual {
            return Err(TransportError::Crc { expected, actual });
        }
        let node = NodeId::from_u8(packet[2])
            .ok_or_else(|| TransportError::Malformed(format!("unknown node {:#04x}", packet[2])))?;
        Ok(Some((node, packet[HEADER_LEN..total - CRC_LEN].to_vec())))
    }
}

/// Link statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub crc_errors: u64,
}

struct ReadState {
    decoder: FrameDecoder,
    scratch: Vec<u8>,
}

/// Transport over a serial port opened with `serial2-tokio`.
pub struct SerialTransport {
    port: SerialPort,
    port_name: String,
    max_frame_len: usize,
    read_state: Mutex<ReadState>,
    write_lock: Mutex<()>,
    stats: Arc<Mutex<TransportStats>>,
    link_down: AtomicBool,
}

impl SerialTransport {
    pub fn open(port_name: &str, baud: u32, max_frame_len: usize) -> Result<Self, TransportError> {
        tracing::info!("Opening bus on {} at {} baud", port_name, baud);
        let port = SerialPort::open(port_name, baud)?;
        Ok(Self {
            port,
            port_name: port_name.to_string(),
            max_frame_len,
            read_state: Mutex::new(ReadState {
                decoder: FrameDecoder::new(max_frame_len),
                scratch: vec![0u8; max_frame_len],
            }),
            write_lock: Mutex::new(()),
            stats: Arc::new(Mutex::new(TransportStats::default())),
            link_down: AtomicBool::new(false),
        })
    }

    /// Get link statistics
    pub async fn get_stats(&self) -> TransportStats {
        self.stats.lock().await.clone()
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn mark_down(&self, e: std::io::Error) -> TransportError {
        tracing::error!("Serial link {} failed: {}", self.port_name, e);
        self.link_down.store(true, Ordering::SeqCst);
        TransportError::Io(e)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&self, node: NodeId, frame: &[u8]) -> Result<(), TransportError> {
        if self.link_down.load(Ordering::SeqCst) {
            return Err(TransportError::LinkDown);
        }
        let packet = encode_frame(node, frame, self.max_frame_len)?;
        {
            // Whole frames only; concurrent senders must not interleave bytes.
            let _guard = self.write_lock.lock().await;
            let mut written = 0;
            while written < packet.len() {
                match self.port.write(&packet[written..]).await {
                    Ok(0) => return Err(self.mark_down(std::io::ErrorKind::WriteZero.into())),
                    Ok(n) => written += n,
                    Err(e) => return Err(self.mark_down(e)),
                }
            }
        }
        tracing::trace!("Bus TX -> {}: {} bytes", node, packet.len());
        let mut stats = self.stats.lock().await;
        stats.frames_sent += 1;
        stats.bytes_sent += packet.len() as u64;
        Ok(())
    }

    async fn recv(&self) -> Result<(NodeId, Vec<u8>), TransportError> {
        let mut state = self.read_state.lock().await;
        loop {
            if self.link_down.load(Ordering::SeqCst) {
                return Err(TransportError::LinkDown);
            }
            match state.decoder.next_frame() {
                Ok(Some((node, body))) => {
                    let mut stats = self.stats.lock().await;
                    stats.frames_received += 1;
                    stats.bytes_received += (body.len() + HEADER_LEN + CRC_LEN) as u64;
                    return Ok((node, body));
                }
                Ok(None) => {}
                Err(e) => {
                    if matches!(e, TransportError::Crc { .. }) {
                        self.stats.lock().await.crc_errors += 1;
                    }
                    return Err(e);
                }
            }
            let ReadState { decoder, scratch } = &mut *state;
            match self.port.read(scratch).await {
                Ok(0) => {
                    tracing::info!("Serial connection closed by remote");
                    self.link_down.store(true, Ordering::SeqCst);
                    return Err(TransportError::LinkDown);
                }
                Ok(n) => decoder.push(&scratch[..n]),
                Err(e) => return Err(self.mark_down(e)),
            }
        }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("max_frame_len", &self.max_frame_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_xmodem_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_decoder_handles_split_reads() {
        let packet = encode_frame(NodeId::HeadL, &[1, 2, 3, 4], 64).unwrap();
        let mut decoder = FrameDecoder::new(64);
        decoder.push(&packet[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&packet[3..]);
        let (node, body) = decoder.next_frame().unwrap().unwrap();
        assert_eq!(node, NodeId::HeadL);
        assert_eq!(body, vec![1, 2, 3, 4]);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_decoder_yields_back_to_back_frames_in_order() {
        let mut decoder = FrameDecoder::new(64);
        decoder.push(&encode_frame(NodeId::GantryX, &[7], 64).unwrap());
        decoder.push(&encode_frame(NodeId::GantryY, &[8, 9], 64).unwrap());
        assert_eq!(decoder.next_frame().unwrap().unwrap(), (NodeId::GantryX, vec![7]));
        assert_eq!(decoder.next_frame().unwrap().unwrap(), (NodeId::GantryY, vec![8, 9]));
    }

    #[test]
    fn test_decoder_rejects_corrupted_frame_and_recovers() {
        let mut bad = encode_frame(NodeId::HeadR, &[1, 2], 64).unwrap();
        bad[4] ^= 0xFF;
        let good = encode_frame(NodeId::HeadR, &[3], 64).unwrap();
        let mut decoder = FrameDecoder::new(64);
        decoder.push(&bad);
        decoder.push(&good);
        assert!(matches!(decoder.next_frame(), Err(TransportError::Crc { .. })));
        assert_eq!(decoder.next_frame().unwrap().unwrap(), (NodeId::HeadR, vec![3]));
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let body = vec![0u8; 64];
        assert!(matches!(
            encode_frame(NodeId::HeadL, &body, 32),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }
}
