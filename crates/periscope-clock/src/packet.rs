//! NTP v4 client-mode packet layout.
//!
//! Timestamps are the conventional 32.32 fixed point, seconds since 1900;
//! conversion to Unix microseconds uses the 2208988800-second epoch bias.

use periscope_core::{Error, Result};

/// Size of an NTP request/response without extensions.
pub const NTP_PACKET_LEN: usize = 48;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_DELTA_SECS: u64 = 2_208_988_800;

const ORIGINATE_OFFSET: usize = 24;
const RECEIVE_OFFSET: usize = 32;
const TRANSMIT_OFFSET: usize = 40;

/// Server-side timestamps extracted from a response, Unix microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimestamps {
    /// Echo of the client transmit time (T1).
    pub originate_us: u64,
    /// Server receive time (T2).
    pub receive_us: u64,
    /// Server transmit time (T3).
    pub transmit_us: u64,
}

fn to_ntp_parts(unix_us: u64) -> (u32, u32) {
    let secs = unix_us / 1_000_000 + NTP_UNIX_DELTA_SECS;
    let frac = ((unix_us % 1_000_000) << 32) / 1_000_000;
    (secs as u32, frac as u32)
}

fn from_ntp_parts(secs: u32, frac: u32) -> u64 {
    let unix_secs = u64::from(secs).saturating_sub(NTP_UNIX_DELTA_SECS);
    let micros = (u64::from(frac) * 1_000_000) >> 32;
    unix_secs * 1_000_000 + micros
}

fn read_timestamp(buf: &[u8], offset: usize) -> u64 {
    let secs = u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
    let frac = u32::from_be_bytes([
        buf[offset + 4],
        buf[offset + 5],
        buf[offset + 6],
        buf[offset + 7],
    ]);
    from_ntp_parts(secs, frac)
}

/// Build a client-mode request carrying `transmit_us` (T1) in the transmit
/// timestamp field.
pub fn client_request(transmit_us: u64) -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    // LI = 3 (unsynchronized), version = 4, mode = 3 (client)
    packet[0] = 0b1110_0011;

    let (secs, frac) = to_ntp_parts(transmit_us);
    packet[TRANSMIT_OFFSET..TRANSMIT_OFFSET + 4].copy_from_slice(&secs.to_be_bytes());
    packet[TRANSMIT_OFFSET + 4..TRANSMIT_OFFSET + 8].copy_from_slice(&frac.to_be_bytes());
    packet
}

/// Extract T1/T2/T3 from a server response.
pub fn parse_response(buf: &[u8]) -> Result<ServerTimestamps> {
    if buf.len() < NTP_PACKET_LEN {
        return Err(Error::protocol(format!(
            "short NTP response: {} bytes",
            buf.len()
        )));
    }
    Ok(ServerTimestamps {
        originate_us: read_timestamp(buf, ORIGINATE_OFFSET),
        receive_us: read_timestamp(buf, RECEIVE_OFFSET),
        transmit_us: read_timestamp(buf, TRANSMIT_OFFSET),
    })
}

/// Write a server-style response echoing `originate_us` with the given
/// receive/transmit stamps. Used by loopback tests.
#[cfg(test)]
pub fn server_response(originate_us: u64, receive_us: u64, transmit_us: u64) -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    // LI = 0, version = 4, mode = 4 (server)
    packet[0] = 0b0010_0100;
    for (offset, value) in [
        (ORIGINATE_OFFSET, originate_us),
        (RECEIVE_OFFSET, receive_us),
        (TRANSMIT_OFFSET, transmit_us),
    ] {
        let (secs, frac) = to_ntp_parts(value);
        packet[offset..offset + 4].copy_from_slice(&secs.to_be_bytes());
        packet[offset + 4..offset + 8].copy_from_slice(&frac.to_be_bytes());
    }
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_is_client_mode_v4() {
        let packet = client_request(0);
        assert_eq!(packet[0] & 0x07, 3, "mode must be client");
        assert_eq!((packet[0] >> 3) & 0x07, 4, "version must be 4");
        assert_eq!(packet.len(), NTP_PACKET_LEN);
    }

    #[test]
    fn timestamp_conversion_round_trips_within_a_microsecond() {
        for unix_us in [0u64, 1, 999_999, 1_700_000_000_123_456, 1_756_000_000_000_001] {
            let (secs, frac) = to_ntp_parts(unix_us);
            let back = from_ntp_parts(secs, frac);
            assert!(back.abs_diff(unix_us) <= 1, "{unix_us} -> {back}");
        }
    }

    #[test]
    fn response_round_trips_server_timestamps() {
        let t1 = 1_700_000_000_000_000;
        let t2 = t1 + 5_000;
        let t3 = t2 + 20;
        let packet = server_response(t1, t2, t3);
        let parsed = parse_response(&packet).unwrap();
        assert!(parsed.originate_us.abs_diff(t1) <= 1);
        assert!(parsed.receive_us.abs_diff(t2) <= 1);
        assert!(parsed.transmit_us.abs_diff(t3) <= 1);
    }

    #[test]
    fn short_response_is_rejected() {
        assert!(parse_response(&[0u8; 40]).is_err());
    }
}
