// Control-channel message codec.
//
// The control characteristic speaks protobuf-framed request/response
// messages. The schema is small and frozen (four request shapes, five
// response shapes), so the wire format is implemented directly here as a
// byte codec rather than through a codegen toolchain.
//
// Layout reference, proto3 wire format:
//   tag = (field_number << 3) | wire_type
//   wire_type 0 = varint, 2 = length-delimited
//
//   ControlRequest  oneof: 1 calibrate_sensor, 2 firmware_version,
//                          3 hardware_version, 4 setting
//   ControlResponse oneof: 1 firmware_version, 2 hardware_version,
//                          3 sensor_readings, 4 setting_ack,
//                          5 calibration_ack
//   Version: 1 major, 2 minor, 3 revision, 4 build (uint32),
//            5 commit (bytes), 6 timestamp (int64, Unix seconds),
//            7 hash (bytes)

use crate::error::{Error, Result};

// ============================================================================
// Message types
// ============================================================================

/// Sensor calibration targets accepted by the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrateTarget {
    BiteMin = 1,
    BiteMax = 2,
    SuckMin = 3,
    SuckMax = 4,
}

/// Requests written to the control characteristic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    CalibrateSensor(CalibrateTarget),
    FirmwareVersion,
    HardwareVersion,
    Setting { name: String },
}

/// Version payload carried by firmware/hardware version responses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub build: u32,
    pub commit: Vec<u8>,
    /// Build time as Unix seconds; 0 means the device has no timestamp.
    pub timestamp: i64,
    /// SHA-256 of the running image, per the MCUboot spec.
    pub hash: Vec<u8>,
}

/// Responses notified on the control characteristic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlResponse {
    FirmwareVersion(Version),
    HardwareVersion(Version),
    /// Raw sensor readings payload; the driver consumes sensor data from
    /// the dedicated characteristics instead, so this is carried opaque.
    SensorReadings(Vec<u8>),
    SettingAck,
    CalibrationAck,
    /// A oneof discriminant this driver does not recognize.
    Unknown { field: u32 },
}

/// Response discriminant, used to match a response to its pending request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    FirmwareVersion,
    HardwareVersion,
    SensorReadings,
    SettingAck,
    CalibrationAck,
    Unknown,
}

impl ControlRequest {
    /// The response discriminant that resolves this request.
    pub fn expected_response(&self) -> ResponseKind {
        match self {
            ControlRequest::CalibrateSensor(_) => ResponseKind::CalibrationAck,
            ControlRequest::FirmwareVersion => ResponseKind::FirmwareVersion,
            ControlRequest::HardwareVersion => ResponseKind::HardwareVersion,
            ControlRequest::Setting { .. } => ResponseKind::SettingAck,
        }
    }
}

impl ControlResponse {
    pub fn kind(&self) -> ResponseKind {
        match self {
            ControlResponse::FirmwareVersion(_) => ResponseKind::FirmwareVersion,
            ControlResponse::HardwareVersion(_) => ResponseKind::HardwareVersion,
            ControlResponse::SensorReadings(_) => ResponseKind::SensorReadings,
            ControlResponse::SettingAck => ResponseKind::SettingAck,
            ControlResponse::CalibrationAck => ResponseKind::CalibrationAck,
            ControlResponse::Unknown { .. } => ResponseKind::Unknown,
        }
    }
}

// ============================================================================
// Varint primitives
// ============================================================================

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_tag(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    put_varint(buf, ((field as u64) << 3) | wire_type as u64);
}

fn put_len_delimited(buf: &mut Vec<u8>, field: u32, payload: &[u8]) {
    put_tag(buf, field, 2);
    put_varint(buf, payload.len() as u64);
    buf.extend_from_slice(payload);
}

/// Emit a varint field, omitting it at its default value as proto3 does.
fn put_varint_field(buf: &mut Vec<u8>, field: u32, value: u64) {
    if value != 0 {
        put_tag(buf, field, 0);
        put_varint(buf, value);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| Error::MalformedMessage("truncated varint".into()))?;
            self.pos += 1;
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::MalformedMessage("varint overruns 64 bits".into()))
    }

    /// Read a field tag, returning (field_number, wire_type).
    fn tag(&mut self) -> Result<(u32, u8)> {
        let tag = self.varint()?;
        Ok(((tag >> 3) as u32, (tag & 0x7) as u8))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.varint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::MalformedMessage("length-delimited field overruns buffer".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Skip a field of the given wire type.
    fn skip(&mut self, wire_type: u8) -> Result<()> {
        match wire_type {
            0 => {
                self.varint()?;
            }
            1 => self.advance(8)?,
            2 => {
                self.bytes()?;
            }
            5 => self.advance(4)?,
            other => {
                return Err(Error::MalformedMessage(format!(
                    "unsupported wire type {other}"
                )));
            }
        }
        Ok(())
    }

    fn advance(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.buf.len() {
            return Err(Error::MalformedMessage("truncated fixed-width field".into()));
        }
        self.pos += n;
        Ok(())
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a request for a write to the control characteristic.
pub fn encode_request(request: &ControlRequest) -> Vec<u8> {
    let mut buf = Vec::new();
    match request {
        ControlRequest::CalibrateSensor(target) => {
            let mut inner = Vec::new();
            put_varint_field(&mut inner, 1, *target as u64);
            put_len_delimited(&mut buf, 1, &inner);
        }
        ControlRequest::FirmwareVersion => put_len_delimited(&mut buf, 2, &[]),
        ControlRequest::HardwareVersion => put_len_delimited(&mut buf, 3, &[]),
        ControlRequest::Setting { name } => {
            let mut inner = Vec::new();
            put_len_delimited(&mut inner, 1, name.as_bytes());
            put_len_delimited(&mut buf, 4, &inner);
        }
    }
    buf
}

fn encode_version(version: &Version) -> Vec<u8> {
    let mut buf = Vec::new();
    put_varint_field(&mut buf, 1, version.major as u64);
    put_varint_field(&mut buf, 2, version.minor as u64);
    put_varint_field(&mut buf, 3, version.revision as u64);
    put_varint_field(&mut buf, 4, version.build as u64);
    if !version.commit.is_empty() {
        put_len_delimited(&mut buf, 5, &version.commit);
    }
    put_varint_field(&mut buf, 6, version.timestamp as u64);
    if !version.hash.is_empty() {
        put_len_delimited(&mut buf, 7, &version.hash);
    }
    buf
}

/// Encode a response. The driver never writes responses; this exists for
/// device simulators and tests.
pub fn encode_response(response: &ControlResponse) -> Vec<u8> {
    let mut buf = Vec::new();
    match response {
        ControlResponse::FirmwareVersion(v) => put_len_delimited(&mut buf, 1, &encode_version(v)),
        ControlResponse::HardwareVersion(v) => put_len_delimited(&mut buf, 2, &encode_version(v)),
        ControlResponse::SensorReadings(raw) => put_len_delimited(&mut buf, 3, raw),
        ControlResponse::SettingAck => put_len_delimited(&mut buf, 4, &[]),
        ControlResponse::CalibrationAck => put_len_delimited(&mut buf, 5, &[]),
        ControlResponse::Unknown { field } => put_len_delimited(&mut buf, *field, &[]),
    }
    buf
}

// ============================================================================
// Decoding
// ============================================================================

fn decode_version(payload: &[u8]) -> Result<Version> {
    let mut reader = Reader::new(payload);
    let mut version = Version::default();
    while !reader.done() {
        let (field, wire_type) = reader.tag()?;
        match (field, wire_type) {
            (1, 0) => version.major = reader.varint()? as u32,
            (2, 0) => version.minor = reader.varint()? as u32,
            (3, 0) => version.revision = reader.varint()? as u32,
            (4, 0) => version.build = reader.varint()? as u32,
            (5, 2) => version.commit = reader.bytes()?.to_vec(),
            (6, 0) => version.timestamp = reader.varint()? as i64,
            (7, 2) => version.hash = reader.bytes()?.to_vec(),
            (_, wt) => reader.skip(wt)?,
        }
    }
    Ok(version)
}

/// Decode a notification payload from the control characteristic.
pub fn decode_response(payload: &[u8]) -> Result<ControlResponse> {
    let mut reader = Reader::new(payload);
    let mut response = None;
    while !reader.done() {
        let (field, wire_type) = reader.tag()?;
        if wire_type != 2 {
            reader.skip(wire_type)?;
            continue;
        }
        let inner = reader.bytes()?;
        // Last oneof field wins, as in proto3.
        response = Some(match field {
            1 => ControlResponse::FirmwareVersion(decode_version(inner)?),
            2 => ControlResponse::HardwareVersion(decode_version(inner)?),
            3 => ControlResponse::SensorReadings(inner.to_vec()),
            4 => ControlResponse::SettingAck,
            5 => ControlResponse::CalibrationAck,
            other => ControlResponse::Unknown { field: other },
        });
    }
    response.ok_or_else(|| Error::MalformedMessage("empty control response".into()))
}

/// Decode a request payload. Counterpart of [`encode_request`] for device
/// simulators and tests.
pub fn decode_request(payload: &[u8]) -> Result<ControlRequest> {
    let mut reader = Reader::new(payload);
    let mut request = None;
    while !reader.done() {
        let (field, wire_type) = reader.tag()?;
        if wire_type != 2 {
            reader.skip(wire_type)?;
            continue;
        }
        let inner = reader.bytes()?;
        request = Some(match field {
            1 => {
                let mut inner_reader = Reader::new(inner);
                let mut target = None;
                while !inner_reader.done() {
                    let (f, wt) = inner_reader.tag()?;
                    if (f, wt) == (1, 0) {
                        target = Some(match inner_reader.varint()? {
                            1 => CalibrateTarget::BiteMin,
                            2 => CalibrateTarget::BiteMax,
                            3 => CalibrateTarget::SuckMin,
                            4 => CalibrateTarget::SuckMax,
                            other => {
                                return Err(Error::MalformedMessage(format!(
                                    "unknown calibration sensor {other}"
                                )));
                            }
                        });
                    } else {
                        inner_reader.skip(wt)?;
                    }
                }
                let target = target.ok_or_else(|| {
                    Error::MalformedMessage("calibrate request without a sensor".into())
                })?;
                ControlRequest::CalibrateSensor(target)
            }
            2 => ControlRequest::FirmwareVersion,
            3 => ControlRequest::HardwareVersion,
            4 => {
                let mut inner_reader = Reader::new(inner);
                let mut name = String::new();
                while !inner_reader.done() {
                    let (f, wt) = inner_reader.tag()?;
                    if (f, wt) == (1, 2) {
                        name = String::from_utf8(inner_reader.bytes()?.to_vec())
                            .map_err(|_| Error::MalformedMessage("setting name is not UTF-8".into()))?;
                    } else {
                        inner_reader.skip(wt)?;
                    }
                }
                ControlRequest::Setting { name }
            }
            other => {
                return Err(Error::MalformedMessage(format!(
                    "unknown control request discriminant {other}"
                )));
            }
        });
    }
    request.ok_or_else(|| Error::MalformedMessage("empty control request".into()))
}
