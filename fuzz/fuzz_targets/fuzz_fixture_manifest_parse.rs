#![no_main]

use dd_expect::FixtureRegistry;
use dd_types::{InputToolchain, RuntimeVersion};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };
    if body.len() > 16 * 1024 {
        return;
    }

    let Ok(registry) = FixtureRegistry::from_yaml_str("/fixtures", body) else {
        return;
    };
    for test in registry.names() {
        for toolchain in InputToolchain::ALL {
            for version in RuntimeVersion::ALL {
                if let Some(fixture) = registry.lookup(test, toolchain, version) {
                    assert_eq!(fixture.name, test);
                    assert!(fixture.directory.ends_with(test));
                }
            }
        }
    }
});
