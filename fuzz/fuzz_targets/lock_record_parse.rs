#![no_main]

use libfuzzer_sys::fuzz_target;
use ward_lock::LockRecord;

fuzz_target!(|data: &[u8]| {
    match LockRecord::parse(data) {
        Ok(record) => {
            assert_ne!(record.owner_pid, 0);
            let encoded = record.to_json_bytes().expect("encode parsed record");
            let reparsed = LockRecord::parse(&encoded).expect("re-parse encoded record");
            assert_eq!(reparsed.owner_pid, record.owner_pid);
            assert_eq!(reparsed.owner_token, record.owner_token);
            assert_eq!(reparsed.host_identifier, record.host_identifier);
        }
        Err(reason) => assert!(reason.is_content_problem()),
    }
});
