#![no_main]

use libfuzzer_sys::fuzz_target;
use ward_runs::RegistryDocument;
use ward_store::decode_document;

fuzz_target!(|data: &[u8]| {
    let Ok(document) = decode_document::<RegistryDocument>(data) else {
        return;
    };
    let encoded = serde_json::to_vec(&document).expect("encode decoded document");
    let reparsed = decode_document::<RegistryDocument>(&encoded).expect("re-decode");
    assert_eq!(reparsed.records.len(), document.records.len());
    assert!(reparsed.records.keys().eq(document.records.keys()));
});
