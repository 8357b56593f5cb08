use burn::{
    module::Param,
    nn::{Embedding, EmbeddingConfig, Initializer},
    prelude::*,
    tensor::Distribution,
};

/// Bag-of-words text embedding: looks up one row per token and combines the
/// rows of a review with the sqrt-n combiner (sum divided by the square root
/// of the token count). Masked positions contribute nothing.
#[derive(Module, Debug)]
pub struct TextEmbedding<B: Backend> {
    embedding: Embedding<B>,
    dim: usize,
}

impl<B: Backend> TextEmbedding<B> {
    /// `tokens` and `mask` are `[batch, seq]`; returns `[batch, dim]`.
    pub fn forward(&self, tokens: Tensor<B, 2, Int>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch_size, _] = tokens.dims();

        let x = self.embedding.forward(tokens);
        let x = x * mask.clone().unsqueeze_dim::<3>(2);
        let x = x.sum_dim(1).reshape([batch_size, self.dim]);

        let counts = mask.sum_dim(1).clamp_min(1.0).sqrt();
        x / counts
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn weights(&self) -> Tensor<B, 2> {
        self.embedding.weight.val()
    }
}

#[derive(Config, Debug)]
pub struct TextEmbeddingConfig {
    pub rows: usize,
    pub dim: usize,

    #[config(default = 0.1)]
    pub init_std: f64,
}

impl TextEmbeddingConfig {
    fn initializer(&self) -> Initializer {
        Initializer::Normal {
            mean: 0.0,
            std: self.init_std,
        }
    }

    /// Every row randomly initialized.
    pub fn init<B: Backend>(&self, device: &B::Device) -> TextEmbedding<B> {
        TextEmbedding {
            embedding: EmbeddingConfig::new(self.rows, self.dim)
                .with_initializer(self.initializer())
                .init(device),
            dim: self.dim,
        }
    }

    /// The leading rows come from `values` (row-major, `dim` wide); the
    /// remaining rows are randomly initialized.
    pub fn init_pretrained<B: Backend>(&self, values: &[f32], device: &B::Device) -> TextEmbedding<B> {
        let known = (values.len() / self.dim).min(self.rows);
        let pretrained = Tensor::<B, 2>::from_data(
            TensorData::new(values[..known * self.dim].to_vec(), [known, self.dim])
                .convert::<B::FloatElem>(),
            device,
        );

        let weight = if known < self.rows {
            let rest = Tensor::<B, 2>::random(
                [self.rows - known, self.dim],
                Distribution::Normal(0.0, self.init_std),
                device,
            );
            Tensor::cat(vec![pretrained, rest], 0)
        } else {
            pretrained
        };

        TextEmbedding {
            embedding: Embedding {
                weight: Param::from_tensor(weight),
            },
            dim: self.dim,
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type B = NdArray<f32>;

    fn assert_close(actual: Vec<f32>, expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn combines_tokens_with_sqrt_n() {
        let device = Default::default();
        let module = TextEmbeddingConfig::new(3, 2)
            .init_pretrained::<B>(&[1.0, 0.0, 0.0, 2.0, 3.0, 3.0], &device);

        let tokens = Tensor::<B, 2, Int>::from_data([[0i64, 1], [2, 0]], &device);
        let mask = Tensor::<B, 2>::from_data([[1.0f32, 1.0], [1.0, 0.0]], &device);

        let output: Vec<f32> = module.forward(tokens, mask).into_data().iter::<f32>().collect();
        let root2 = 2f32.sqrt();
        assert_close(output, &[1.0 / root2, 2.0 / root2, 3.0, 3.0]);
    }

    #[test]
    fn fully_masked_review_is_zero() {
        let device = Default::default();
        let module = TextEmbeddingConfig::new(4, 3).init::<B>(&device);

        let tokens = Tensor::<B, 2, Int>::from_data([[1i64, 2]], &device);
        let mask = Tensor::<B, 2>::zeros([1, 2], &device);

        let output: Vec<f32> = module.forward(tokens, mask).into_data().iter::<f32>().collect();
        assert_close(output, &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn pretrained_rows_are_followed_by_random_rows() {
        let device = Default::default();
        let module = TextEmbeddingConfig::new(5, 2).init_pretrained::<B>(&[1.0, 2.0, 3.0, 4.0], &device);

        assert_eq!(module.weights().dims(), [5, 2]);
        let head: Vec<f32> = module
            .weights()
            .slice([0..2, 0..2])
            .into_data()
            .iter::<f32>()
            .collect();
        assert_close(head, &[1.0, 2.0, 3.0, 4.0]);
    }
}
