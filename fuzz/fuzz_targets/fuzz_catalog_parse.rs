#![no_main]

//! Arbitrary expectation catalogs. Whatever loads must evaluate on every
//! cell of the grid without panicking.

use dd_expect::{ConditionCatalog, OutcomeCategory};
use dd_types::CellAxes;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };
    if body.len() > 16 * 1024 {
        return;
    }

    let Ok(catalog) = ConditionCatalog::from_yaml_str(body) else {
        return;
    };
    let tests = catalog.mentioned_tests();
    for axes in CellAxes::grid().take(64) {
        for test in &tests {
            for category in OutcomeCategory::ALL {
                let _ = catalog.applies(category, test, &axes);
            }
        }
    }
});
