use burn::{prelude::*, tensor::activation::relu, train::ClassificationOutput};
use nn::{loss::CrossEntropyLossConfig, Linear, LinearConfig};

use crate::{
    data::{Polarity, ReviewBatch},
    module::text_embedding::TextEmbedding,
};

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    embedding: TextEmbedding<B>,
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
}

impl<B: Backend> Model<B> {
    pub fn forward(&self, tokens: Tensor<B, 2, Int>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.embedding.forward(tokens, mask);

        let x = self
            .hidden
            .iter()
            .fold(x, |x, linear| relu(linear.forward(x)));

        self.output.forward(x)
    }

    pub fn forward_classification(&self, batch: ReviewBatch<B>) -> ClassificationOutput<B> {
        let output = self.forward(batch.tokens, batch.mask);

        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), batch.targets.clone());

        ClassificationOutput::new(loss, output, batch.targets)
    }

    pub fn embedding(&self) -> &TextEmbedding<B> {
        &self.embedding
    }
}

/// The output layer always has one logit per [`Polarity`].
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = "vec![500, 100]")]
    pub hidden_units: Vec<usize>,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, embedding: TextEmbedding<B>, device: &B::Device) -> Model<B> {
        let mut input = embedding.dim();

        let mut hidden = vec![];
        for &units in &self.hidden_units {
            hidden.push(LinearConfig::new(input, units).init(device));
            input = units;
        }

        Model {
            embedding,
            hidden,
            output: LinearConfig::new(input, Polarity::ALL.len()).init(device),
        }
    }
}
