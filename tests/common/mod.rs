use std::fs;
use std::path::{Path, PathBuf};

/// A small license file declaring two features for vendor MLM.
pub const LICENSE_FILE: &str = "\
SERVER lic1 0019ABCDEF01 27000\n\
VENDOR MLM\n\
FEATURE MATLAB MLM R2023a permanent 10 SIGN=ABCD\n\
FEATURE Simulink MLM R2023a permanent 4 SIGN=EF01\n";

/// lmstat output matching [`LICENSE_FILE`]: 7 of 10 MATLAB seats in use.
pub const LMSTAT_OUTPUT: &str = "\
lmstat - Copyright (c) 1989-2023 Flexera. All Rights Reserved.\n\
License server status: 27000@lic1\n\
\n\
Users of MATLAB:  (Total of 10 licenses issued;  Total of 7 licenses in use)\n\
  \"MATLAB\" vR2023a, vendor: MLM, expiry: permanent\n\
Users of Simulink:  (Total of 4 licenses issued;  Total of 0 licenses in use)\n\
  \"Simulink\" vR2023a, vendor: MLM, expiry: permanent\n";

pub fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}
