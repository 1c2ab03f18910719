/// Modbus RTU CRC16 (reflected polynomial 0xA001, seed 0xFFFF).
///
/// The result goes on the wire low byte first (`crc.to_le_bytes()`).
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    let poly: u16 = 0xA001;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Appends the CRC of `frame` to it in wire order.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Checks the trailing two CRC bytes of a complete RTU frame.
pub fn verify_crc(frame: &[u8]) -> Result<(), (u16, u16)> {
    if frame.len() < 2 {
        return Err((0, 0));
    }
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let computed = crc16_modbus(&frame[..data_len]);
    if received == computed {
        Ok(())
    } else {
        Err((computed, received))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_modbus() {
        // Read 10 holding registers from unit 1 at address 0: 01 03 00 00 00 0A C5 CD
        let data = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        let crc = crc16_modbus(&data);
        assert_eq!(crc.to_le_bytes(), [0xC5, 0xCD]);
    }

    #[test]
    fn test_crc16_empty_is_seed() {
        assert_eq!(crc16_modbus(&[]), 0xFFFF);
    }

    #[test]
    fn test_verify_crc() {
        let mut frame = vec![0x11, 0x03, 0x02, 0x12, 0x34];
        append_crc(&mut frame);
        assert!(verify_crc(&frame).is_ok());

        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(verify_crc(&frame).is_err());
    }
}
