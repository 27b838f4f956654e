//! Minimal Modbus responders for tests, RTU over TCP and Modbus TCP.
use std::{
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    thread::JoinHandle,
    time::Duration,
};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Reply {
    /// Register reads answer `address + index` for every register, coil and
    /// discrete input reads answer `true` for odd addresses, writes are
    /// echoed.
    Data,
    /// Answer every request with the given exception code.
    Exception(u8),
    /// Never answer.
    Silent,
}

#[derive(Debug, Clone, Copy)]
enum Framing {
    Rtu,
    Tcp,
}

/// One received request: unit id followed by the PDU, without CRC or MBAP
/// header.
#[derive(Debug)]
pub(crate) struct Request {
    pub connection: usize,
    pub frame: Vec<u8>,
}

pub(crate) struct FakeDevice {
    address: String,
    thread: JoinHandle<Vec<Request>>,
}

impl FakeDevice {
    /// Serves `connections` RTU over TCP connections one after another,
    /// then stops.
    pub fn rtu(connections: usize, reply: Reply) -> Self {
        Self::spawn(Framing::Rtu, connections, reply)
    }

    /// Same as [`FakeDevice::rtu`] with MBAP framing.
    pub fn tcp(connections: usize, reply: Reply) -> Self {
        Self::spawn(Framing::Tcp, connections, reply)
    }

    fn spawn(framing: Framing, connections: usize, reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let thread = std::thread::spawn(move || {
            let mut requests = Vec::new();
            for connection in 0..connections {
                let (mut stream, _) = listener.accept().unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                serve(&mut stream, framing, connection, reply, &mut requests);
            }
            requests
        });
        Self { address, thread }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Waits until all connections have been closed by the client.
    pub fn join(self) -> Vec<Request> {
        self.thread.join().unwrap()
    }
}

fn serve(
    stream: &mut TcpStream,
    framing: Framing,
    connection: usize,
    reply: Reply,
    requests: &mut Vec<Request>,
) {
    loop {
        let received = match framing {
            Framing::Rtu => read_rtu(stream).map(|frame| (frame, None)),
            Framing::Tcp => read_mbap(stream).map(|(header, frame)| (frame, Some(header))),
        };
        let Ok((frame, transaction)) = received else {
            break;
        };
        let rsp = respond(&frame, reply);
        requests.push(Request { connection, frame });
        let Some(rsp) = rsp else {
            continue;
        };
        let out = match transaction {
            None => {
                let mut out = rsp;
                let crc = crc16(&out);
                out.extend_from_slice(&crc.to_le_bytes());
                out
            }
            Some(transaction) => {
                let mut out = Vec::with_capacity(rsp.len() + 6);
                out.extend_from_slice(&transaction.to_be_bytes());
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&(rsp.len() as u16).to_be_bytes());
                out.extend_from_slice(&rsp);
                out
            }
        };
        if stream.write_all(&out).is_err() {
            break;
        }
    }
}

fn read_rtu(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut frame = vec![0u8; 6];
    stream.read_exact(&mut frame)?;
    if matches!(frame[1], 0x0F | 0x10) {
        let mut byte_count = [0u8; 1];
        stream.read_exact(&mut byte_count)?;
        frame.push(byte_count[0]);
        let mut data = vec![0u8; usize::from(byte_count[0])];
        stream.read_exact(&mut data)?;
        frame.extend_from_slice(&data);
    }
    let mut crc = [0u8; 2];
    stream.read_exact(&mut crc)?;
    assert_eq!(crc16(&frame).to_le_bytes(), crc, "bad CRC in {frame:02X?}");
    Ok(frame)
}

fn read_mbap(stream: &mut TcpStream) -> io::Result<(u16, Vec<u8>)> {
    let mut header = [0u8; 6];
    stream.read_exact(&mut header)?;
    let transaction = u16::from_be_bytes([header[0], header[1]]);
    let length = u16::from_be_bytes([header[4], header[5]]);
    let mut frame = vec![0u8; usize::from(length)];
    stream.read_exact(&mut frame)?;
    Ok((transaction, frame))
}

/// Builds the reply (unit id followed by the PDU) for one request.
fn respond(frame: &[u8], reply: Reply) -> Option<Vec<u8>> {
    let function = frame[1];
    let mut rsp = vec![frame[0]];
    match reply {
        Reply::Silent => return None,
        Reply::Exception(code) => {
            rsp.push(function | 0x80);
            rsp.push(code);
        }
        Reply::Data => {
            let address = u16::from_be_bytes([frame[2], frame[3]]);
            let quantity = u16::from_be_bytes([frame[4], frame[5]]);
            match function {
                0x01 | 0x02 => {
                    let mut bits = vec![0u8; usize::from(quantity).div_ceil(8)];
                    for index in 0..quantity {
                        if (address + index) % 2 == 1 {
                            bits[usize::from(index / 8)] |= 1 << (index % 8);
                        }
                    }
                    rsp.push(function);
                    rsp.push(bits.len() as u8);
                    rsp.extend_from_slice(&bits);
                }
                0x03 | 0x04 => {
                    rsp.push(function);
                    rsp.push((quantity * 2) as u8);
                    for register in address..address + quantity {
                        rsp.extend_from_slice(&register.to_be_bytes());
                    }
                }
                // Single writes echo the request, multiple writes echo
                // address and quantity.
                _ => rsp.extend_from_slice(&frame[1..6]),
            }
        }
    }
    Some(rsp)
}

pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFF_u16;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// An address nobody listens on.
pub(crate) fn refused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_reference_frame() {
        // Read holding register 0x0000, quantity 1, slave 1
        assert_eq!(
            crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).to_le_bytes(),
            [0x84, 0x0A]
        );
    }

    #[test]
    fn coil_reply_packs_odd_addresses() {
        let rsp = respond(&[1, 0x01, 0x00, 0x00, 0x00, 0x0A], Reply::Data).unwrap();
        assert_eq!(rsp, [1, 0x01, 2, 0b1010_1010, 0b0000_0010]);
    }
}
