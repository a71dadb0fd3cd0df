//! Key extractor. Locates a 32-byte `master_key` (and, for the v4
//! image-key path, a 16-byte image key) in a process memory stream: a
//! chunked region scan generalized to a predicate-driven validator,
//! parallelizable across memory regions.

pub mod validator;

use crate::error::{CoreError, CoreResult};
use crate::model::KEY_SIZE;
use crate::process::MemoryReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub use validator::{image_key_validator, page1_hmac_validator};

/// Stops a running scan early; checked at least once per memory region.
pub type CancellationToken = std::sync::Arc<AtomicBool>;

pub fn new_cancellation_token() -> CancellationToken {
    std::sync::Arc::new(AtomicBool::new(false))
}

/// Scans `reader` for a `KEY_SIZE`-byte window satisfying `validator`.
///
/// Windows are visited at every byte offset within each region: alignment
/// is not assumed, since `master_key` has no guaranteed alignment in the
/// target's heap.
///
/// The scan is single-threaded per call; [`find_parallel`] is the
/// multi-core entry point. This sequential version exists for reader
/// implementations that can't be split across threads (and for tests).
pub fn find(
    reader: &mut dyn MemoryReader,
    validator: impl Fn(&[u8; KEY_SIZE]) -> bool,
    cancel: &CancellationToken,
) -> CoreResult<[u8; KEY_SIZE]> {
    while let Some(region) = reader.next_region()? {
        if cancel.load(Ordering::Relaxed) {
            return Err(CoreError::OperationCanceled);
        }
        if let Some(key) = scan_region(&region.bytes, &validator) {
            return Ok(key);
        }
    }
    Err(CoreError::KeyNotFound)
}

fn scan_region(bytes: &[u8], validator: &impl Fn(&[u8; KEY_SIZE]) -> bool) -> Option<[u8; KEY_SIZE]> {
    if bytes.len() < KEY_SIZE {
        return None;
    }
    for window in bytes.windows(KEY_SIZE) {
        let candidate: [u8; KEY_SIZE] = window.try_into().ok()?;
        if validator(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Parallel variant: drains all regions from `reader` up front (the
/// reader itself is single-owner), then fans the per-region scan out
/// over a thread scope. The first region to validate sets `found` and
/// signals siblings to stop. The **lowest-offset** match wins when more
/// than one region validates concurrently: each worker records
/// `(region_index, key)` under a mutex and only overwrites the recorded
/// answer with a lower index.
pub fn find_parallel(
    reader: &mut dyn MemoryReader,
    validator: impl Fn(&[u8; KEY_SIZE]) -> bool + Sync,
    cancel: &CancellationToken,
) -> CoreResult<[u8; KEY_SIZE]> {
    let mut regions = Vec::new();
    while let Some(region) = reader.next_region()? {
        regions.push(region);
    }

    let found: Mutex<Option<(usize, [u8; KEY_SIZE])>> = Mutex::new(None);
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for (idx, region) in regions.iter().enumerate() {
            let validator = &validator;
            let found = &found;
            let stop = &stop;
            let cancel = cancel.clone();
            scope.spawn(move || {
                if stop.load(Ordering::Relaxed) || cancel.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(key) = scan_region(&region.bytes, validator) {
                    let mut guard = found.lock().unwrap();
                    let better = match *guard {
                        None => true,
                        Some((existing_idx, _)) => idx < existing_idx,
                    };
                    if better {
                        *guard = Some((idx, key));
                    }
                    stop.store(true, Ordering::Relaxed);
                }
            });
        }
    });

    if cancel.load(Ordering::Relaxed) && found.lock().unwrap().is_none() {
        return Err(CoreError::OperationCanceled);
    }

    found
        .into_inner()
        .unwrap()
        .map(|(_, key)| key)
        .ok_or(CoreError::KeyNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MemoryRegion;

    struct VecReader(Vec<Vec<u8>>, usize);
    impl MemoryReader for VecReader {
        fn next_region(&mut self) -> CoreResult<Option<MemoryRegion>> {
            if self.1 >= self.0.len() {
                return Ok(None);
            }
            let bytes = self.0[self.1].clone();
            self.1 += 1;
            Ok(Some(MemoryRegion { base: 0, bytes }))
        }
        fn read_at(&mut self, _address: usize, _size: usize) -> CoreResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn finds_planted_key() {
        let mut planted = [0u8; KEY_SIZE];
        planted[0] = 0xAB;
        let mut region = vec![0u8; 100];
        region[10..10 + KEY_SIZE].copy_from_slice(&planted);
        let mut reader = VecReader(vec![region], 0);

        let found = find(&mut reader, |c| *c == planted, &new_cancellation_token()).unwrap();
        assert_eq!(found, planted);
    }

    #[test]
    fn reports_not_found_on_exhaustive_miss() {
        let mut reader = VecReader(vec![vec![0u8; 64]], 0);
        let err = find(&mut reader, |_| false, &new_cancellation_token()).unwrap_err();
        assert!(matches!(err, CoreError::KeyNotFound));
    }
}
