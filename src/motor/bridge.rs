// Serial motor bridge protocol
//
// The bridge is a microcontroller that owns the four PWM/direction channels and
// the wheel encoders. Frames follow the usual servo-bus layout:
// [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
//
// Duties travel as sign-magnitude permille, wheel rates as sign-magnitude
// milli-revolutions per second. Both are little-endian, wheel order FL, FR, RL, RR.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

use super::kinematics::{NUM_WHEELS, WheelRates};

/// Default serial configuration for the bridge
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 10;
pub const DEFAULT_BRIDGE_ID: u8 = 1;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Duty full scale on the wire
const DUTY_SCALE: f32 = 1000.0;

/// Wheel rate full scale on the wire (milli-rev/s)
const RATE_SCALE: f32 = 1000.0;

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Register map of the bridge
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Register {
    FirmwareVersion = 0, // 1 byte, read-only
    Brake = 8,           // 1 byte: write 1 to cut all channels
    DutyCommand = 16,    // 8 bytes: 4 x i16 sign-magnitude permille
    WheelRate = 32,      // 8 bytes: 4 x i16 sign-magnitude milli-rev/s, read-only
}

/// Error types for bridge communication
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from bridge {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for bridge {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Bridge {id} returned error status: 0x{status:02X}")]
    DeviceError { id: u8, status: u8 },

    #[error("Timeout waiting for response from bridge {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Serial link to the motor bridge
pub struct MotorBridge {
    port: Box<dyn SerialPort>,
    id: u8,
}

impl MotorBridge {
    /// Open the bridge with the default baudrate and id
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with(port_name, DEFAULT_BAUDRATE, DEFAULT_BRIDGE_ID)
    }

    pub fn open_with(port_name: &str, baudrate: u32, id: u8) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port, id })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Ping the bridge; `Ok(false)` on timeout
    pub fn ping(&mut self) -> Result<bool> {
        let packet = build_packet(self.id, Instruction::Ping, &[]);
        self.send_packet(&packet)?;

        match self.read_response() {
            Ok(_) => Ok(true),
            Err(BridgeError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read the firmware version byte
    pub fn firmware_version(&mut self) -> Result<u8> {
        let data = self.read_register(Register::FirmwareVersion, 1)?;
        Ok(data[0])
    }

    /// Write four duties in [-1, 1]
    pub fn write_duties(&mut self, duties: &[f32; NUM_WHEELS]) -> Result<()> {
        let params = encode_duties(duties);
        debug!("Bridge duty frame: {:02X?}", params);
        self.write_register(Register::DutyCommand, &params)
    }

    /// Cut all channels at once
    pub fn brake(&mut self) -> Result<()> {
        self.write_register(Register::Brake, &[1])
    }

    /// Read measured wheel rates (rev/s)
    pub fn read_wheel_rates(&mut self) -> Result<WheelRates> {
        let data = self.read_register(Register::WheelRate, (NUM_WHEELS * 2) as u8)?;
        Ok(decode_rates(&data))
    }

    fn write_register(&mut self, register: Register, data: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(data.len() + 1);
        params.push(register as u8);
        params.extend_from_slice(data);

        let packet = build_packet(self.id, Instruction::Write, &params);
        self.send_packet(&packet)?;
        self.read_response()?;
        Ok(())
    }

    fn read_register(&mut self, register: Register, len: u8) -> Result<Vec<u8>> {
        let packet = build_packet(self.id, Instruction::Read, &[register as u8, len]);
        self.send_packet(&packet)?;

        let data = self.read_response()?;
        if data.len() < len as usize {
            return Err(BridgeError::InvalidResponse {
                id: self.id,
                reason: format!("Expected {} bytes, got {}", len, data.len()),
            });
        }
        Ok(data)
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read a status packet and return its parameters
    fn read_response(&mut self) -> Result<Vec<u8>> {
        let id = self.id;
        let mut header = [0u8; 2];
        self.port.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                BridgeError::Timeout { id }
            } else {
                BridgeError::Io(e)
            }
        })?;

        if header != HEADER {
            return Err(BridgeError::InvalidResponse {
                id,
                reason: format!("Invalid header: {:02X?}", header),
            });
        }

        let mut id_length = [0u8; 2];
        self.port.read_exact(&mut id_length)?;
        let length = id_length[1] as usize;
        if length < 2 {
            return Err(BridgeError::InvalidResponse {
                id,
                reason: format!("Length {} too short", length),
            });
        }

        let mut body = vec![0u8; length];
        self.port.read_exact(&mut body)?;

        let mut frame = Vec::with_capacity(length + 2);
        frame.extend_from_slice(&id_length);
        frame.extend_from_slice(&body);
        parse_status(id, &frame)
    }
}

/// Checksum over everything after the header
fn checksum(data: &[u8]) -> u8 {
    let sum: u16 = data.iter().map(|&b| b as u16).sum();
    (!sum & 0xFF) as u8
}

fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 2) as u8; // params + instruction + checksum
    let mut packet = Vec::with_capacity(6 + params.len());

    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(instruction as u8);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));

    packet
}

/// Validate a status frame `[id, len, status, params..., checksum]`
fn parse_status(expected_id: u8, frame: &[u8]) -> Result<Vec<u8>> {
    let (&last, covered) = frame.split_last().ok_or_else(|| BridgeError::InvalidResponse {
        id: expected_id,
        reason: "Empty frame".to_string(),
    })?;
    if covered.len() < 3 {
        return Err(BridgeError::InvalidResponse {
            id: expected_id,
            reason: format!("Frame of {} bytes too short", frame.len()),
        });
    }

    let id = covered[0];
    if id != expected_id {
        return Err(BridgeError::InvalidResponse {
            id: expected_id,
            reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
        });
    }
    if checksum(covered) != last {
        return Err(BridgeError::ChecksumMismatch { id });
    }

    let status = covered[2];
    if status != 0 {
        return Err(BridgeError::DeviceError { id, status });
    }
    Ok(covered[3..].to_vec())
}

fn encode_duties(duties: &[f32; NUM_WHEELS]) -> Vec<u8> {
    duties
        .iter()
        .flat_map(|&d| {
            let d = if d.is_finite() { d.clamp(-1.0, 1.0) } else { 0.0 };
            encode_sign_magnitude((d * DUTY_SCALE).round() as i16).to_le_bytes()
        })
        .collect()
}

fn decode_rates(data: &[u8]) -> WheelRates {
    let mut rates = [0.0; NUM_WHEELS];
    for (i, chunk) in data.chunks_exact(2).take(NUM_WHEELS).enumerate() {
        let raw = u16::from_le_bytes([chunk[0], chunk[1]]);
        rates[i] = decode_sign_magnitude(raw) as f32 / RATE_SCALE;
    }
    WheelRates(rates)
}

/// Bit 15 = sign (1 = negative), bits 0-14 = magnitude
fn encode_sign_magnitude(value: i16) -> u16 {
    let magnitude = value.unsigned_abs().min(0x7FFF);
    if value < 0 { 0x8000 | magnitude } else { magnitude }
}

fn decode_sign_magnitude(raw: u16) -> i16 {
    let magnitude = (raw & 0x7FFF) as i16;
    if raw & 0x8000 != 0 { -magnitude } else { magnitude }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        // ~(1+4+3+30+0+2) = ~40 = 215
        let data = [1u8, 4, 0x03, 30, 0, 2];
        assert_eq!(checksum(&data), 215);
    }

    #[test]
    fn test_sign_magnitude() {
        assert_eq!(encode_sign_magnitude(0), 0);
        assert_eq!(encode_sign_magnitude(1000), 1000);
        assert_eq!(encode_sign_magnitude(-100), 0x8064);
        assert_eq!(encode_sign_magnitude(i16::MIN), 0xFFFF);

        assert_eq!(decode_sign_magnitude(0x8064), -100);
        assert_eq!(decode_sign_magnitude(1000), 1000);
    }

    #[test]
    fn test_duty_frame_layout() {
        let params = encode_duties(&[1.0, -0.5, 0.0, f32::NAN]);
        assert_eq!(params.len(), 8);
        assert_eq!(&params[0..2], &1000u16.to_le_bytes());
        assert_eq!(&params[2..4], &(0x8000u16 | 500).to_le_bytes());
        assert_eq!(&params[4..6], &[0, 0]);
        assert_eq!(&params[6..8], &[0, 0]);
    }

    #[test]
    fn test_duty_frame_clamps_overrange() {
        let params = encode_duties(&[3.0, -3.0, 0.0, 0.0]);
        assert_eq!(&params[0..2], &1000u16.to_le_bytes());
        assert_eq!(&params[2..4], &(0x8000u16 | 1000).to_le_bytes());
    }

    #[test]
    fn test_build_packet() {
        let packet = build_packet(1, Instruction::Write, &[Register::Brake as u8, 1]);
        assert_eq!(packet.len(), 8);
        assert_eq!(&packet[..2], &HEADER);
        assert_eq!(packet[2], 1); // ID
        assert_eq!(packet[3], 4); // params + instruction + checksum
        assert_eq!(packet[4], 0x03);
        assert_eq!(packet[7], checksum(&packet[2..7]));
    }

    #[test]
    fn test_parse_wheel_rate_status() {
        // id, len, status, 8 data bytes, checksum
        let mut frame = vec![1u8, 10, 0];
        for raw in [1500u16, 0x8000 | 250, 0, 8000] {
            frame.extend_from_slice(&raw.to_le_bytes());
        }
        frame.push(checksum(&frame));

        let data = parse_status(1, &frame).expect("valid frame");
        let rates = decode_rates(&data);
        assert_eq!(rates.as_array(), [1.5, -0.25, 0.0, 8.0]);
    }

    #[test]
    fn test_parse_status_rejects_corruption() {
        let mut frame = vec![1u8, 2, 0];
        frame.push(checksum(&frame));
        assert!(parse_status(1, &frame).is_ok());

        let mut bad = frame.clone();
        bad[3] ^= 0xFF;
        assert!(matches!(parse_status(1, &bad), Err(BridgeError::ChecksumMismatch { .. })));

        assert!(matches!(
            parse_status(2, &frame),
            Err(BridgeError::InvalidResponse { .. })
        ));

        let mut fault = vec![1u8, 2, 0x20];
        fault.push(checksum(&fault));
        assert!(matches!(
            parse_status(1, &fault),
            Err(BridgeError::DeviceError { status: 0x20, .. })
        ));
    }
}
