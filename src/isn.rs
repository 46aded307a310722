//! Initial sequence numbers (RFC 6528).
//!
//! `ISN = M + F(local, remote, secret)`: `M` is a clock ticking every 4
//! microseconds, `F` a keyed hash of the connection identity. Reincarnations of
//! the same identity therefore start further along the sequence space, while
//! different identities cannot predict each other's numbers.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::time::Instant;

use crate::Quad;

pub struct IsnGenerator {
    keys: RandomState,
    secret: u64,
    epoch: Instant,
}

impl IsnGenerator {
    pub fn new(epoch: Instant) -> Self {
        Self {
            keys: RandomState::new(),
            secret: rand::random(),
            epoch,
        }
    }

    pub fn generate(&self, quad: &Quad, now: Instant) -> u32 {
        let ticks = (now.saturating_duration_since(self.epoch).as_micros() / 4) as u32;

        let mut hasher = self.keys.build_hasher();
        self.secret.hash(&mut hasher);
        quad.hash(&mut hasher);
        let offset = hasher.finish() as u32;

        offset.wrapping_add(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    fn quad(remote_port: u16) -> Quad {
        Quad {
            local: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 443),
            remote: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), remote_port),
        }
    }

    #[test]
    fn advances_with_the_clock() {
        let epoch = Instant::now();
        let isn = IsnGenerator::new(epoch);
        let first = isn.generate(&quad(40000), epoch);
        let later = isn.generate(&quad(40000), epoch + Duration::from_millis(4));
        assert_eq!(later.wrapping_sub(first), 1000);
    }

    #[test]
    fn differs_across_generators() {
        let epoch = Instant::now();
        let a = IsnGenerator::new(epoch);
        let b = IsnGenerator::new(epoch);
        // 2^-32 chance of a false failure per attempt
        let same = (40000..40004)
            .all(|port| a.generate(&quad(port), epoch) == b.generate(&quad(port), epoch));
        assert!(!same);
    }
}
