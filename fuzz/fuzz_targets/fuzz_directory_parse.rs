#![no_main]
use archive_cache::core::directory::ArchiveDirectory;
use archive_cache::SpanningHeap;
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

// Malformed directory files must fail cleanly, never panic
fuzz_target!(|data: &[u8]| {
    if let Ok(directory) = ArchiveDirectory::from_bytes(data) {
        // Anything that parses must serialize back to the same layout
        let reparsed = ArchiveDirectory::from_bytes(&directory.to_bytes()).unwrap();
        assert_eq!(reparsed, directory);
    }

    let _ = ArchiveDirectory::load(&mut Cursor::new(data));
    let _ = SpanningHeap::restore(data);
});
