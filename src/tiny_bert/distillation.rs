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

use crate::common::error::FastBertError;
use std::borrow::Borrow;
use tch::nn::Module;
use tch::{nn, Kind, Reduction, Tensor};

/// Intermediate network outputs a distillation pair exposes to the loss
/// composition: embedding output, per-layer attention scores and hidden
/// states, and the classifier logits.
pub struct EncoderFeatures {
    /// Embedding layer output, shape `[batch_size, sequence_length, hidden_size]`
    pub embedding_output: Tensor,
    /// Raw attention scores per encoder layer, shape `[batch_size, num_heads, sequence_length, sequence_length]`
    pub attention_scores: Vec<Tensor>,
    /// Hidden states per encoder layer, shape `[batch_size, sequence_length, hidden_size]`
    pub encoder_layers: Vec<Tensor>,
    /// Classification logits, shape `[batch_size, label_size]`
    pub logits: Tensor,
}

/// The four distillation loss terms of a teacher/student pair.
pub struct DistillationLosses {
    pub embedding: Tensor,
    pub attention: Tensor,
    pub hidden: Tensor,
    pub prediction: Tensor,
}

impl DistillationLosses {
    /// Scalar training loss, the sum of the four terms.
    pub fn total(&self) -> Tensor {
        &self.embedding + &self.attention + &self.hidden + &self.prediction
    }
}

fn weighted_mse(
    prediction: &Tensor,
    target: &Tensor,
    sample_weight: Option<&Tensor>,
    weight_shape: &[i64],
) -> Tensor {
    match sample_weight {
        Some(weight) => ((prediction - target).pow(2.0f64) * weight.view(weight_shape))
            .mean(Kind::Float),
        None => prediction.mse_loss(target, Reduction::Mean),
    }
}

/// Mean squared error between a learned linear projection of the student
/// embedding output and the (gradient-stopped) teacher embedding output.
pub fn embedding_loss<'a, P: Borrow<nn::Path<'a>>>(
    p: P,
    teacher_embedding: &Tensor,
    student_embedding: &Tensor,
    teacher_hidden_size: i64,
    sample_weight: Option<&Tensor>,
) -> Result<Tensor, FastBertError> {
    let p = p.borrow();
    let (_, _, student_hidden_size) = student_embedding.size3()?;
    let projection = nn::linear(
        p / "embedding_projection",
        student_hidden_size,
        teacher_hidden_size,
        Default::default(),
    );
    let projected = projection.forward(student_embedding);
    Ok(weighted_mse(
        &projected,
        &teacher_embedding.detach(),
        sample_weight,
        &[-1, 1, 1],
    ))
}

/// Number of teacher layers mapped onto each student layer. The teacher depth
/// must be an exact multiple of the student depth.
fn layer_stride(
    num_teacher_layers: usize,
    num_student_layers: usize,
) -> Result<usize, FastBertError> {
    if num_student_layers == 0 || num_teacher_layers % num_student_layers != 0 {
        return Err(FastBertError::InvalidConfigurationError(format!(
            "Teacher depth {} is not a multiple of student depth {}",
            num_teacher_layers, num_student_layers
        )));
    }
    Ok(num_teacher_layers / num_student_layers)
}

/// Sum over student layers of the MSE between student attention scores and the
/// teacher attention scores of the last teacher layer in each projection
/// group.
pub fn attention_loss(
    teacher_scores: &[Tensor],
    student_scores: &[Tensor],
    sample_weight: Option<&Tensor>,
) -> Result<Tensor, FastBertError> {
    let stride = layer_stride(teacher_scores.len(), student_scores.len())?;
    let mut total = Tensor::zeros(&[], (Kind::Float, student_scores[0].device()));
    for (layer, student) in student_scores.iter().enumerate() {
        let teacher = teacher_scores[stride * layer + stride - 1].detach();
        total = total + weighted_mse(student, &teacher, sample_weight, &[-1, 1, 1, 1]);
    }
    Ok(total)
}

/// Sum over student layers of the MSE between linearly projected student
/// hidden states and the matching teacher hidden states.
pub fn hidden_loss<'a, P: Borrow<nn::Path<'a>>>(
    p: P,
    teacher_layers: &[Tensor],
    student_layers: &[Tensor],
    teacher_hidden_size: i64,
    sample_weight: Option<&Tensor>,
) -> Result<Tensor, FastBertError> {
    let p = p.borrow();
    let stride = layer_stride(teacher_layers.len(), student_layers.len())?;
    let mut total = Tensor::zeros(&[], (Kind::Float, student_layers[0].device()));
    for (layer, student) in student_layers.iter().enumerate() {
        let (_, _, student_hidden_size) = student.size3()?;
        let projection = nn::linear(
            p / format!("hidden_projection_{}", layer),
            student_hidden_size,
            teacher_hidden_size,
            Default::default(),
        );
        let teacher = teacher_layers[stride * layer + stride - 1].detach();
        total = total + weighted_mse(&projection.forward(student), &teacher, sample_weight, &[-1, 1, 1]);
    }
    Ok(total)
}

/// Soft cross-entropy between the (gradient-stopped) teacher prediction
/// distribution and the student log-probabilities.
pub fn prediction_loss(
    teacher_logits: &Tensor,
    student_logits: &Tensor,
    sample_weight: Option<&Tensor>,
) -> Tensor {
    let teacher_probs = teacher_logits.softmax(-1, Kind::Float).detach();
    let student_log_probs = student_logits.log_softmax(-1, Kind::Float);
    let mut loss = -(teacher_probs * student_log_probs).sum_dim_intlist(&[-1], false, Kind::Float);
    if let Some(weight) = sample_weight {
        loss = loss * weight.view([-1]);
    }
    loss.mean(Kind::Float)
}

/// Compose the full distillation loss of a teacher/student pair.
pub fn distillation_loss<'a, P: Borrow<nn::Path<'a>>>(
    p: P,
    teacher: &EncoderFeatures,
    student: &EncoderFeatures,
    teacher_hidden_size: i64,
    sample_weight: Option<&Tensor>,
) -> Result<DistillationLosses, FastBertError> {
    let p = p.borrow();
    Ok(DistillationLosses {
        embedding: embedding_loss(
            p,
            &teacher.embedding_output,
            &student.embedding_output,
            teacher_hidden_size,
            sample_weight,
        )?,
        attention: attention_loss(
            &teacher.attention_scores,
            &student.attention_scores,
            sample_weight,
        )?,
        hidden: hidden_loss(
            p,
            &teacher.encoder_layers,
            &student.encoder_layers,
            teacher_hidden_size,
            sample_weight,
        )?,
        prediction: prediction_loss(&teacher.logits, &student.logits, sample_weight),
    })
}

/// # Classification capability set
/// Selects the activation, prediction and loss functions of a classifier by
/// variant tag, instead of overriding an inference method per subclass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationMode {
    /// Mutually exclusive classes: softmax activation, argmax predictions,
    /// one-hot cross-entropy loss
    SingleLabel,
    /// Independent binary labels: sigmoid activation, 0.5-threshold
    /// predictions, element-wise binary cross-entropy loss
    MultiLabel,
}

impl ClassificationMode {
    /// Turn classifier logits into probabilities.
    pub fn activate(&self, logits: &Tensor) -> Tensor {
        match self {
            ClassificationMode::SingleLabel => logits.softmax(-1, Kind::Float),
            ClassificationMode::MultiLabel => logits.sigmoid(),
        }
    }

    /// Turn probabilities into predictions: class indices for single-label,
    /// boolean indicators for multi-label.
    pub fn predictions(&self, probs: &Tensor) -> Tensor {
        match self {
            ClassificationMode::SingleLabel => probs.argmax(-1, false),
            ClassificationMode::MultiLabel => probs.gt(0.5),
        }
    }

    /// Per-example classification loss against integer label ids
    /// (single-label) or binary indicator rows (multi-label), optionally
    /// sample-weighted.
    pub fn per_example_loss(
        &self,
        logits: &Tensor,
        label_ids: &Tensor,
        sample_weight: Option<&Tensor>,
    ) -> Tensor {
        let loss = match self {
            ClassificationMode::SingleLabel => -logits
                .log_softmax(-1, Kind::Float)
                .gather(-1, &label_ids.unsqueeze(-1), false)
                .squeeze_dim(-1),
            ClassificationMode::MultiLabel => logits
                .binary_cross_entropy_with_logits::<Tensor>(
                    &label_ids.totype(Kind::Float),
                    None,
                    None,
                    Reduction::None,
                )
                .sum_dim_intlist(&[-1], false, Kind::Float),
        };
        match sample_weight {
            Some(weight) => loss * weight.view([-1]),
            None => loss,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tch::{Device, Kind, Tensor};

    fn features(layers: usize, hidden: i64, labels: i64) -> EncoderFeatures {
        EncoderFeatures {
            embedding_output: Tensor::rand(&[2, 4, hidden], (Kind::Float, Device::Cpu)),
            attention_scores: (0..layers)
                .map(|_| Tensor::rand(&[2, 2, 4, 4], (Kind::Float, Device::Cpu)))
                .collect(),
            encoder_layers: (0..layers)
                .map(|_| Tensor::rand(&[2, 4, hidden], (Kind::Float, Device::Cpu)))
                .collect(),
            logits: Tensor::rand(&[2, labels], (Kind::Float, Device::Cpu)),
        }
    }

    #[test]
    fn total_is_sum_of_terms() {
        let vs = nn::VarStore::new(Device::Cpu);
        let teacher = features(4, 8, 2);
        let student = features(2, 6, 2);
        let losses = distillation_loss(&vs.root(), &teacher, &student, 8, None).unwrap();
        let expected = losses.embedding.double_value(&[])
            + losses.attention.double_value(&[])
            + losses.hidden.double_value(&[])
            + losses.prediction.double_value(&[]);
        assert!((losses.total().double_value(&[]) - expected).abs() < 1e-5);
    }

    #[test]
    fn indivisible_depths_rejected() {
        let teacher = features(5, 8, 2);
        let student = features(2, 6, 2);
        assert!(matches!(
            attention_loss(&teacher.attention_scores, &student.attention_scores, None),
            Err(FastBertError::InvalidConfigurationError(_))
        ));
    }

    #[test]
    fn unit_sample_weight_matches_unweighted() {
        let teacher = features(2, 8, 2);
        let student = features(2, 8, 2);
        let ones = Tensor::ones(&[2], (Kind::Float, Device::Cpu));
        let unweighted =
            attention_loss(&teacher.attention_scores, &student.attention_scores, None).unwrap();
        let weighted = attention_loss(
            &teacher.attention_scores,
            &student.attention_scores,
            Some(&ones),
        )
        .unwrap();
        assert!((unweighted.double_value(&[]) - weighted.double_value(&[])).abs() < 1e-5);
    }

    #[test]
    fn prediction_loss_minimal_for_matching_logits() {
        let logits = Tensor::of_slice(&[5f32, -5f32, -5f32, 5f32]).view([2, 2]);
        let matching = prediction_loss(&logits, &logits, None);
        let shuffled = prediction_loss(&logits, &logits.flip(&[-1]), None);
        assert!(matching.double_value(&[]) < shuffled.double_value(&[]));
    }

    #[test]
    fn single_label_activation_normalizes() {
        let logits = Tensor::of_slice(&[1f32, 2f32, 3f32, 4f32]).view([2, 2]);
        let probs = ClassificationMode::SingleLabel.activate(&logits);
        let row_sums = probs.sum_dim_intlist(&[-1], false, Kind::Float);
        assert!((row_sums.double_value(&[0]) - 1.0).abs() < 1e-5);
        assert!((row_sums.double_value(&[1]) - 1.0).abs() < 1e-5);
        let preds = ClassificationMode::SingleLabel.predictions(&probs);
        assert_eq!(preds.int64_value(&[0]), 1);
    }

    #[test]
    fn multi_label_predictions_threshold() {
        let probs = Tensor::of_slice(&[0.9f32, 0.2f32, 0.4f32, 0.7f32]).view([2, 2]);
        let preds = ClassificationMode::MultiLabel.predictions(&probs);
        assert_eq!(preds.int64_value(&[0, 0]), 1);
        assert_eq!(preds.int64_value(&[0, 1]), 0);
        assert_eq!(preds.int64_value(&[1, 1]), 1);
    }

    #[test]
    fn single_label_loss_matches_nll() {
        let logits = Tensor::of_slice(&[2f32, 0f32, 0f32, 2f32]).view([2, 2]);
        let labels = Tensor::of_slice(&[0i64, 0i64]);
        let loss = ClassificationMode::SingleLabel.per_example_loss(&logits, &labels, None);
        let log_probs = logits.log_softmax(-1, Kind::Float);
        assert!((loss.double_value(&[0]) + log_probs.double_value(&[0, 0])).abs() < 1e-5);
        assert!((loss.double_value(&[1]) + log_probs.double_value(&[1, 0])).abs() < 1e-5);
    }
}
