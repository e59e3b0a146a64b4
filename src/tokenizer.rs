use once_cell::sync::OnceCell;
use std::{fmt, sync::Arc};
use tiktoken_rs::{get_bpe_from_model, CoreBPE};

use crate::error::SyncError;

pub const DEFAULT_TOKENIZER_MODEL: &str = "gpt-3.5-turbo";

static DEFAULT_TOKENIZER: OnceCell<Arc<Tokenizer>> = OnceCell::new();

/// Subword token counter bound to one model vocabulary.
#[derive(Clone)]
pub struct Tokenizer {
    model: String,
    bpe: Arc<CoreBPE>,
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tokenizer")
            .field("model", &self.model)
            .finish()
    }
}

impl Tokenizer {
    /// Fails with [`SyncError::Config`] when the model has no known vocabulary.
    pub fn for_model(model: &str) -> Result<Self, SyncError> {
        let bpe = get_bpe_from_model(model).map_err(|e| {
            SyncError::Config(format!("unsupported tokenizer model '{model}': {e}"))
        })?;
        tracing::debug!("[Tokenizer] loaded vocabulary for model {}", model);
        Ok(Tokenizer {
            model: model.to_string(),
            bpe: Arc::new(bpe),
        })
    }

    pub fn default_model() -> Result<Self, SyncError> {
        Self::for_model(DEFAULT_TOKENIZER_MODEL)
    }

    /// Shared instance for [`DEFAULT_TOKENIZER_MODEL`], built on first use.
    pub fn shared() -> Result<Arc<Tokenizer>, SyncError> {
        DEFAULT_TOKENIZER
            .get_or_try_init(|| Self::default_model().map(Arc::new))
            .cloned()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn token_count(&self, text: Option<&str>) -> Option<usize> {
        text.map(|text| self.bpe.encode_ordinary(text).len())
    }
}
