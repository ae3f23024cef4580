pub const SYNC_BYTE: u8 = 0x47;
pub const PACKET_SIZE: usize = 188;

/// Minimum bytes needed to look at a packet header.
const HEADER_SIZE: usize = 4;

/// True when a packet header starts at `pos`.
pub fn check_sync(buf: &[u8], pos: usize) -> bool {
    pos + HEADER_SIZE <= buf.len() && buf[pos] == SYNC_BYTE
}

/// First position at or after `from` holding a sync byte.
pub fn next_sync(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len().saturating_sub(HEADER_SIZE - 1)).find(|&pos| check_sync(buf, pos))
}

/// First position at or after `from` that looks like a real packet start: a
/// sync byte whose successor one packet later is also a sync byte (or lies
/// past the end of the buffer).
///
/// Payload bytes equal to 0x47 are common, so a lone sync byte is not
/// enough to resynchronise on.
pub fn next_aligned_sync(buf: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while let Some(found) = next_sync(buf, pos) {
        let successor = found + PACKET_SIZE;
        if successor + HEADER_SIZE > buf.len() || buf[successor] == SYNC_BYTE {
            return Some(found);
        }
        pos = found + 1;
    }
    None
}

/// Decode the program clock reference carried by the packet at the start of
/// `packet`, as a single 27 MHz value (`base * 300 + extension`).
pub fn read_pcr(packet: &[u8]) -> Option<u64> {
    if packet.len() < 12 || packet[0] != SYNC_BYTE {
        return None;
    }

    let adaptation_field_control = (packet[3] & 0x30) >> 4;
    if adaptation_field_control & 0x2 == 0 {
        return None;
    }

    let adaptation_length = packet[4];
    if adaptation_length == 0 {
        return None;
    }

    let flags = packet[5];
    if flags & 0x10 == 0 {
        return None;
    }

    let p = &packet[6..12];
    let base = ((p[0] as u64) << 25)
        | ((p[1] as u64) << 17)
        | ((p[2] as u64) << 9)
        | ((p[3] as u64) << 1)
        | ((p[4] as u64) >> 7);
    let extension = (((p[4] & 0x01) as u64) << 8) | p[5] as u64;

    Some(base * 300 + extension)
}

/// Build one 188-byte packet, optionally carrying a PCR. Used by tests and
/// benches to synthesise streams.
pub fn synth_packet(pid: u16, pcr: Option<u64>, fill: u8) -> Vec<u8> {
    let mut pkt = vec![fill; PACKET_SIZE];
    pkt[0] = SYNC_BYTE;
    pkt[1] = ((pid >> 8) as u8) & 0x1f;
    pkt[2] = pid as u8;

    match pcr {
        Some(value) => {
            let base = value / 300;
            let extension = value % 300;
            // adaptation field + payload
            pkt[3] = 0x30;
            pkt[4] = 7;
            pkt[5] = 0x10;
            pkt[6] = (base >> 25) as u8;
            pkt[7] = (base >> 17) as u8;
            pkt[8] = (base >> 9) as u8;
            pkt[9] = (base >> 1) as u8;
            pkt[10] = (((base & 0x1) as u8) << 7) | 0x7e | ((extension >> 8) as u8 & 0x1);
            pkt[11] = extension as u8;
        }
        None => {
            pkt[3] = 0x10;
        }
    }
    pkt
}
