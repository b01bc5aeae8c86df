use super::types::*;

/// One decoded 64-byte report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Init { cid: u32, cmd: u8, bcnt: u16, data: Vec<u8> },
    Cont { cid: u32, seq: u8, data: Vec<u8> },
}

impl Frame {
    pub fn cid(&self) -> u32 {
        match self {
            Frame::Init { cid, .. } | Frame::Cont { cid, .. } => *cid,
        }
    }
}

/// Bit 7 of byte 4 separates init frames from continuation frames.
pub fn parse_frame(report: &Report) -> Frame {
    let cid = u32::from_be_bytes([report[0], report[1], report[2], report[3]]);
    let byte4 = report[4];

    if byte4 & 0x80 != 0 {
        let bcnt = u16::from_be_bytes([report[5], report[6]]);
        let take = (bcnt as usize).min(INIT_DATA_SIZE);
        Frame::Init { cid, cmd: byte4 & 0x7F, bcnt, data: report[7..7 + take].to_vec() }
    } else {
        Frame::Cont { cid, seq: byte4, data: report[5..].to_vec() }
    }
}

/// Split a response message into an init report and as many continuation
/// reports as needed. Callers keep `payload` within MAX_MESSAGE_SIZE.
pub fn fragment(cid: u32, cmd: u8, payload: &[u8]) -> Vec<Report> {
    let cid_bytes = cid.to_be_bytes();
    let bcnt = payload.len().min(MAX_MESSAGE_SIZE) as u16;
    let payload = &payload[..bcnt as usize];

    let mut init = [0u8; PACKET_SIZE];
    init[0..4].copy_from_slice(&cid_bytes);
    init[4] = cmd | 0x80;
    init[5..7].copy_from_slice(&bcnt.to_be_bytes());
    let first = payload.len().min(INIT_DATA_SIZE);
    init[7..7 + first].copy_from_slice(&payload[..first]);

    let mut reports = vec![init];
    for (seq, chunk) in payload[first..].chunks(CONT_DATA_SIZE).enumerate() {
        let mut cont = [0u8; PACKET_SIZE];
        cont[0..4].copy_from_slice(&cid_bytes);
        cont[4] = seq as u8;
        cont[5..5 + chunk.len()].copy_from_slice(chunk);
        reports.push(cont);
    }
    reports
}

pub fn error_report(cid: u32, code: u8) -> Report {
    let mut report = [0u8; PACKET_SIZE];
    report[0..4].copy_from_slice(&cid.to_be_bytes());
    report[4] = CMD_ERROR | 0x80;
    report[6] = 1;
    report[7] = code;
    report
}

pub fn keepalive_report(cid: u32, status: u8) -> Report {
    let mut report = [0u8; PACKET_SIZE];
    report[0..4].copy_from_slice(&cid.to_be_bytes());
    report[4] = CMD_KEEPALIVE | 0x80;
    report[6] = 1;
    report[7] = status;
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(reports: &[Report]) -> Vec<u8> {
        let Frame::Init { bcnt, mut data, .. } = parse_frame(&reports[0]) else {
            panic!("first report must be an init frame");
        };
        for (i, report) in reports[1..].iter().enumerate() {
            let Frame::Cont { seq, data: chunk, .. } = parse_frame(report) else {
                panic!("expected continuation frame");
            };
            assert_eq!(seq as usize, i);
            data.extend_from_slice(&chunk);
        }
        data.truncate(bcnt as usize);
        data
    }

    #[test]
    fn test_fragment_boundaries() {
        assert_eq!(fragment(1, CMD_CBOR, &[]).len(), 1);
        assert_eq!(fragment(1, CMD_CBOR, &[0u8; 57]).len(), 1);
        assert_eq!(fragment(1, CMD_CBOR, &[0u8; 58]).len(), 2);
        assert_eq!(fragment(1, CMD_CBOR, &[0u8; 57 + 59]).len(), 2);
        assert_eq!(fragment(1, CMD_CBOR, &[0u8; MAX_MESSAGE_SIZE]).len(), 129);
    }

    #[test]
    fn test_fragment_then_parse() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let reports = fragment(0x0102_0304, CMD_CBOR, &payload);
        assert_eq!(parse_frame(&reports[0]).cid(), 0x0102_0304);
        assert_eq!(reassemble(&reports), payload);
    }

    #[test]
    fn test_error_and_keepalive_reports() {
        let err = error_report(7, ERR_CHANNEL_BUSY);
        assert_eq!(
            parse_frame(&err),
            Frame::Init { cid: 7, cmd: CMD_ERROR, bcnt: 1, data: vec![ERR_CHANNEL_BUSY] }
        );
        let ka = keepalive_report(7, KEEPALIVE_STATUS_UPNEEDED);
        assert_eq!(
            parse_frame(&ka),
            Frame::Init { cid: 7, cmd: CMD_KEEPALIVE, bcnt: 1, data: vec![KEEPALIVE_STATUS_UPNEEDED] }
        );
    }

    #[test]
    fn test_max_message_size() {
        assert_eq!(MAX_MESSAGE_SIZE, 7609);
    }
}
