// Copyright 2019 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::common::error::FastBertError;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Model configurations deserialized from a JSON file.
pub trait Config<T>
where
    for<'de> T: Deserialize<'de>,
{
    fn from_file<P: AsRef<Path>>(path: P) -> Result<T, FastBertError> {
        let f = File::open(path)?;
        let br = BufReader::new(f);
        let config: T = serde_json::from_reader(br)?;
        Ok(config)
    }
}
