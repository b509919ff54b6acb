#![no_main]
use libfuzzer_sys::fuzz_target;
use proofmode_core::ots::DetachedTimestampFile;

fuzz_target!(|data: &[u8]| {
    if let Ok(file) = DetachedTimestampFile::from_bytes(data) {
        let encoded = file.to_bytes().expect("parsed file must re-encode");
        let reparsed = DetachedTimestampFile::from_bytes(&encoded).expect("re-encoded file must parse");
        assert_eq!(file, reparsed);
    }
});
