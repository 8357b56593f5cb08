pub mod text_embedding;
