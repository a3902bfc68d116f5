//! llama.cpp backend via the `llama-cpp-2` bindings.
//!
//! `LlamaRuntime` owns the backend and the loaded model; `LlamaEngine`
//! borrows the model and owns one context plus its sampler chain. Both
//! release their native handles when dropped, so a session built on an
//! engine cannot outlive the model it was created from.

use std::cell::RefCell;
use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};

use neura_core::config::{ModelConfig, SamplingConfig};
use neura_core::error::NeuraError;
use neura_core::types::{ConversationEntry, Token};

use crate::template::ChatTemplate;
use crate::utf8::Utf8Assembler;
use crate::{decode_chunks, InferenceEngine};

/// Seed value llama.cpp interprets as "pick one at random".
const RANDOM_SEED: u32 = u32::MAX;

/// Loaded backend and model.
pub struct LlamaRuntime {
    backend: LlamaBackend,
    model: LlamaModel,
    config: ModelConfig,
}

impl LlamaRuntime {
    /// Initialise the backend and load the GGUF model named in `config`.
    ///
    /// # Errors
    /// Returns `NeuraError::ModelLoad` if the file does not exist or the
    /// backend refuses it.
    pub fn load(config: &ModelConfig) -> Result<Self, NeuraError> {
        if !Path::new(&config.path).exists() {
            return Err(NeuraError::ModelLoad(format!(
                "model file not found: {}",
                config.path
            )));
        }

        // Backend diagnostics go through the same subscriber as ours.
        send_logs_to_tracing(LogOptions::default());
        let backend = LlamaBackend::init()
            .map_err(|e| NeuraError::ModelLoad(format!("backend init failed: {}", e)))?;

        tracing::info!(
            model = %config.path,
            gpu_layers = config.gpu_layers,
            "Loading llama model"
        );

        let params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);
        let model = LlamaModel::load_from_file(&backend, &config.path, &params)
            .map_err(|e| NeuraError::ModelLoad(format!("failed to load model: {}", e)))?;

        tracing::info!("Llama model loaded");
        Ok(Self {
            backend,
            model,
            config: config.clone(),
        })
    }

    /// Create a fresh context and sampler chain on the loaded model.
    pub fn engine(&self, sampling: &SamplingConfig) -> Result<LlamaEngine<'_>, NeuraError> {
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.config.context_size))
            .with_n_batch(self.config.batch_size)
            .with_n_threads(self.config.threads)
            .with_n_threads_batch(self.config.threads);

        let ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| NeuraError::ModelLoad(format!("failed to create context: {}", e)))?;

        let sampler = LlamaSampler::chain_simple([
            LlamaSampler::min_p(sampling.min_p, 1),
            LlamaSampler::temp(sampling.temperature),
            LlamaSampler::top_k(sampling.top_k),
            LlamaSampler::top_p(sampling.top_p, 0),
            LlamaSampler::dist(sampling.seed.unwrap_or(RANDOM_SEED)),
        ]);

        let native_template = match self.model.chat_template(None) {
            Ok(tmpl) => Some(tmpl),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    fallback = %self.config.template,
                    "Model has no usable chat template, using preset"
                );
                None
            }
        };
        let fallback = ChatTemplate::preset(&self.config.template).ok_or_else(|| {
            NeuraError::Config(format!("unknown template preset '{}'", self.config.template))
        })?;

        tracing::info!(n_ctx = ctx.n_ctx(), "Llama context created");
        Ok(LlamaEngine {
            model: &self.model,
            ctx,
            sampler,
            native_template,
            fallback,
            n_batch: self.config.batch_size.max(1) as usize,
            n_past: 0,
            utf8: RefCell::new(Utf8Assembler::new()),
        })
    }
}

/// One llama.cpp context driven by the chat session.
pub struct LlamaEngine<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    sampler: LlamaSampler,
    native_template: Option<LlamaChatTemplate>,
    fallback: ChatTemplate,
    /// Largest batch a single decode accepts.
    n_batch: usize,
    /// Positions consumed in sequence 0; mirrors the KV cache occupancy.
    n_past: i32,
    utf8: RefCell<Utf8Assembler>,
}

impl LlamaEngine<'_> {
    fn render_native(
        &self,
        tmpl: &LlamaChatTemplate,
        history: &[ConversationEntry],
        add_generation_prompt: bool,
    ) -> Result<String, NeuraError> {
        let chat = history
            .iter()
            .map(|e| LlamaChatMessage::new(e.role().as_str().to_string(), e.content().to_string()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| NeuraError::Template(format!("invalid message: {}", e)))?;
        self.model
            .apply_chat_template(tmpl, &chat, add_generation_prompt)
            .map_err(|e| NeuraError::Template(format!("failed to apply chat template: {}", e)))
    }
}

impl InferenceEngine for LlamaEngine<'_> {
    fn render_template(
        &self,
        history: &[ConversationEntry],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<usize, NeuraError> {
        let Some(tmpl) = self.native_template.as_ref() else {
            return Ok(self
                .fallback
                .render_into(history, add_generation_prompt, buf));
        };
        let rendered = self.render_native(tmpl, history, add_generation_prompt)?;
        let bytes = rendered.as_bytes();
        if bytes.len() <= buf.len() {
            buf[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(bytes.len())
    }

    fn encode(
        &self,
        text: &str,
        add_leading_marker: bool,
        _parse_special: bool,
    ) -> Result<Vec<Token>, NeuraError> {
        let add_bos = if add_leading_marker {
            AddBos::Always
        } else {
            AddBos::Never
        };
        // str_to_token always parses special tokens.
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| NeuraError::Encode(format!("tokenization failed: {}", e)))?;
        Ok(tokens.into_iter().map(|t| Token(t.0)).collect())
    }

    fn cache_used(&self) -> usize {
        self.n_past.max(0) as usize
    }

    fn capacity(&self) -> usize {
        self.ctx.n_ctx() as usize
    }

    fn advance(&mut self, batch: &[Token]) -> Result<(), NeuraError> {
        for (chunk, final_chunk) in decode_chunks(batch, self.n_batch) {
            let mut llama_batch = LlamaBatch::new(chunk.len(), 1);
            let last = chunk.len() - 1;
            for (i, token) in chunk.iter().enumerate() {
                llama_batch
                    .add(
                        LlamaToken::new(token.0),
                        self.n_past + i as i32,
                        &[0],
                        final_chunk && i == last,
                    )
                    .map_err(|e| NeuraError::Inference(format!("batch add failed: {}", e)))?;
            }

            self.ctx
                .decode(&mut llama_batch)
                .map_err(|e| NeuraError::Inference(format!("failed to decode: {}", e)))?;
            self.n_past += chunk.len() as i32;
        }
        if batch.len() > self.n_batch {
            tracing::debug!(tokens = batch.len(), n_batch = self.n_batch, "Prompt decoded in chunks");
        }
        Ok(())
    }

    fn sample_next(&mut self) -> Token {
        let token = self.sampler.sample(&self.ctx, -1);
        self.sampler.accept(token);
        Token(token.0)
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken::new(token.0))
    }

    fn decode_to_text(&self, token: Token) -> String {
        match self
            .model
            .token_to_bytes(LlamaToken::new(token.0), Special::Tokenize)
        {
            Ok(bytes) => self.utf8.borrow_mut().push(&bytes),
            Err(e) => {
                tracing::debug!(token = %token, error = %e, "Token has no text piece");
                String::new()
            }
        }
    }

    fn finish_text(&mut self) -> String {
        self.utf8.get_mut().finish()
    }
}
