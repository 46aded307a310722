//! TCP option parsing (RFC 793, RFC 7323, RFC 2018).
//!
//! Nothing in the connection state machine depends on options; this only
//! exists so callers can inspect what a peer offered. Malformed option lists
//! end the iteration early.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption<'a> {
    End,
    NoOp,
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    Timestamps { value: u32, echo_reply: u32 },
    Unknown { kind: u8, data: &'a [u8] },
}

pub struct Options<'a> {
    bytes: &'a [u8],
}

impl<'a> Options<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl<'a> Iterator for Options<'a> {
    type Item = TcpOption<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&kind, rest) = self.bytes.split_first()?;
        match kind {
            0 => {
                self.bytes = &[];
                return Some(TcpOption::End);
            }
            1 => {
                self.bytes = rest;
                return Some(TcpOption::NoOp);
            }
            _ => {}
        }

        let len = *rest.first()? as usize;
        if len < 2 || len > self.bytes.len() {
            self.bytes = &[];
            return None;
        }
        let data = &self.bytes[2..len];
        self.bytes = &self.bytes[len..];

        let option = match (kind, data) {
            (2, &[hi, lo]) => TcpOption::MaxSegmentSize(u16::from_be_bytes([hi, lo])),
            (3, &[shift]) => TcpOption::WindowScale(shift),
            (4, &[]) => TcpOption::SackPermitted,
            (8, data) if data.len() == 8 => TcpOption::Timestamps {
                value: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                echo_reply: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            },
            (kind, data) => TcpOption::Unknown { kind, data },
        };
        Some(option)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typical_syn_options() {
        let bytes = [
            2, 4, 0x05, 0xb4, // mss 1460
            4, 2, // sack permitted
            8, 10, 0, 0, 0, 1, 0, 0, 0, 0, // timestamps
            1, // nop
            3, 3, 7, // window scale
        ];
        let parsed: Vec<_> = Options::new(&bytes).collect();
        assert_eq!(
            parsed,
            vec![
                TcpOption::MaxSegmentSize(1460),
                TcpOption::SackPermitted,
                TcpOption::Timestamps {
                    value: 1,
                    echo_reply: 0
                },
                TcpOption::NoOp,
                TcpOption::WindowScale(7),
            ]
        );
    }

    #[test]
    fn end_of_list_stops() {
        let parsed: Vec<_> = Options::new(&[1, 0, 2, 4, 0, 1]).collect();
        assert_eq!(parsed, vec![TcpOption::NoOp, TcpOption::End]);
    }

    #[test]
    fn bad_length_stops() {
        assert_eq!(Options::new(&[2, 9, 0, 0]).count(), 0);
        assert_eq!(Options::new(&[2, 1]).count(), 0);
        assert_eq!(Options::new(&[2]).count(), 0);
    }

    #[test]
    fn unknown_kind_keeps_data() {
        let parsed: Vec<_> = Options::new(&[30, 4, 0xaa, 0xbb]).collect();
        assert_eq!(
            parsed,
            vec![TcpOption::Unknown {
                kind: 30,
                data: &[0xaa, 0xbb]
            }]
        );
    }
}
