#![no_main]
use archive_cache::core::{depval, text_table};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);

    if let Ok(table) = text_table::parse_table(&text) {
        let written = text_table::write_table(&table);
        assert_eq!(text_table::parse_table(&written).unwrap(), table);
    }
    if let Ok(groups) = text_table::parse_grouped(&text) {
        let written = text_table::write_grouped(&groups);
        assert_eq!(text_table::parse_grouped(&written).unwrap(), groups);
    }
    let _ = depval::parse_dependency_table(&text);
});
