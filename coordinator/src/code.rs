//! Exchange code generation.

use cashbridge_common::ExchangeCode;
use rand::Rng;

/// Source of candidate exchange codes. Uniqueness is enforced by the store.
pub trait CodeSource: Send + Sync {
    fn next_code(&self) -> Option<ExchangeCode>;
}

/// Uniformly random six-digit codes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodes;

impl CodeSource for RandomCodes {
    fn next_code(&self) -> Option<ExchangeCode> {
        ExchangeCode::from_number(rand::thread_rng().gen_range(0..1_000_000))
    }
}

/// Replays a fixed list of numbers, then runs dry.
#[cfg(test)]
pub(crate) struct SequenceCodes(parking_lot::Mutex<std::collections::VecDeque<u32>>);

#[cfg(test)]
impl SequenceCodes {
    pub(crate) fn new(numbers: impl IntoIterator<Item = u32>) -> Self {
        Self(parking_lot::Mutex::new(numbers.into_iter().collect()))
    }
}

#[cfg(test)]
impl CodeSource for SequenceCodes {
    fn next_code(&self) -> Option<ExchangeCode> {
        self.0.lock().pop_front().and_then(ExchangeCode::from_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_codes_are_well_formed() {
        for _ in 0..1_000 {
            let code = RandomCodes.next_code().unwrap();
            let digits = code.as_str().strip_prefix("BTC-").unwrap();
            assert_eq!(digits.len(), 6);
            assert!(digits.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
