//! Checks that secret bytes are gone before their memory is handed back.
//!
//! A counting allocator scans every freed block for a marker pattern while a
//! check is running. Blocks are allocated zeroed so the scan never reads
//! uninitialized memory.

use safekeep::cipher::{BlockCipher, BLOCK_LEN, KEY_LEN};
use safekeep::secure::SecureBuffer;
use safekeep::VaultError;
use std::alloc::{GlobalAlloc, Layout, System};
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

const MARKER: [u8; 16] = *b"\x5a\xa5wipe--marker\xa5\x5a";

static ARMED: AtomicBool = AtomicBool::new(false);
static LEAKS: AtomicUsize = AtomicUsize::new(0);
static SERIAL: Mutex<()> = Mutex::new(());

struct ScanningAlloc;

unsafe impl GlobalAlloc for ScanningAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        System.alloc_zeroed(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ARMED.load(Ordering::SeqCst) {
            let block = std::slice::from_raw_parts(ptr, layout.size());
            if block.windows(MARKER.len()).any(|w| w == MARKER) {
                LEAKS.fetch_add(1, Ordering::SeqCst);
            }
        }
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: ScanningAlloc = ScanningAlloc;

/// Run `f` with scanning enabled and return how many freed blocks still held
/// the marker
fn leaks_during(f: impl FnOnce()) -> usize {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    LEAKS.store(0, Ordering::SeqCst);
    ARMED.store(true, Ordering::SeqCst);
    f();
    ARMED.store(false, Ordering::SeqCst);
    LEAKS.load(Ordering::SeqCst)
}

#[test]
fn plain_vec_leaves_marker_behind() {
    let leaks = leaks_during(|| {
        let v = black_box(MARKER.to_vec());
        drop(v);
    });
    assert!(leaks >= 1);
}

#[test]
fn secure_buffer_is_wiped_on_drop() {
    let leaks = leaks_during(|| {
        let buf = black_box(SecureBuffer::from_slice(&MARKER).unwrap());
        drop(buf);
    });
    assert_eq!(leaks, 0);
}

#[test]
fn growth_wipes_the_old_allocation() {
    let leaks = leaks_during(|| {
        let mut buf = SecureBuffer::with_capacity(MARKER.len()).unwrap();
        buf.extend_from_slice(&MARKER).unwrap();
        let before = buf.as_bytes().as_ptr();

        // Forces a move to a larger allocation
        buf.extend_from_slice(&[0u8; 100]).unwrap();
        assert_ne!(buf.as_bytes().as_ptr(), before);
        assert_eq!(&buf.as_bytes()[..MARKER.len()], &MARKER);
        drop(black_box(buf));
    });
    assert_eq!(leaks, 0);
}

#[test]
fn bad_padding_does_not_leak_plaintext() {
    let cipher = BlockCipher::new(&[7u8; KEY_LEN]).unwrap();
    let iv = [1u8; BLOCK_LEN];
    let plaintext = [MARKER, MARKER, MARKER].concat();
    let mut ciphertext = cipher.cbc_encrypt(&iv, &plaintext);
    assert_eq!(ciphertext.len(), 4 * BLOCK_LEN);

    // Garbles the third block and turns the padding byte into 0x90; the first
    // two plaintext blocks still decrypt to the marker
    ciphertext[3 * BLOCK_LEN - 1] ^= 0x80;
    drop(plaintext);

    let leaks = leaks_during(|| {
        let result = cipher.cbc_decrypt(&iv, &ciphertext);
        assert!(matches!(result, Err(VaultError::Format(_))));
    });
    assert_eq!(leaks, 0);
}

#[test]
fn good_decrypt_is_wiped_on_drop() {
    let cipher = BlockCipher::new(&[7u8; KEY_LEN]).unwrap();
    let iv = [2u8; BLOCK_LEN];
    let ciphertext = cipher.cbc_encrypt(&iv, &MARKER);

    let leaks = leaks_during(|| {
        let decrypted = cipher.cbc_decrypt(&iv, &ciphertext).unwrap();
        assert_eq!(decrypted.as_bytes(), &MARKER);
        drop(decrypted);
    });
    assert_eq!(leaks, 0);
}
