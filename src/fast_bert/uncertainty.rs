// Copyright 2020 Tencent. All rights reserved.
// Copyright 2021 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

const PROB_EPSILON: f64 = 1e-20;

/// Normalized entropy of a top-class probability, used as a confidence proxy
/// by the classifier cascade.
///
/// Returns a value close to 0 when the classifier head is certain (probability
/// near 0 or 1) and increasing toward 1 as the probability approaches the
/// uniform point. `label_size` is the total number of classes and scales the
/// entropy through the `ln(1/C)` denominator.
pub fn uncertainty(top_prob: f64, label_size: usize) -> f64 {
    let p = top_prob.max(PROB_EPSILON).min(1.0 - PROB_EPSILON);
    (p * p.ln() + (1.0 - p) * (1.0 - p).ln()) / (1.0 / label_size as f64).ln()
}

/// Top-class probability of a probability vector.
pub fn top_class_probability(probs: &[f64]) -> f64 {
    probs.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
}
