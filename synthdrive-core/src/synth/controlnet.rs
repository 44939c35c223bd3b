//! ControlNet adapter for the Stable Diffusion 1.5 UNet.
//!
//! A trainable copy of the UNet encoder that sees the control image through a
//! small convolutional embedding and emits one residual per skip connection
//! plus one for the mid block. Weight names follow the diffusers
//! `ControlNetModel` layout so the safetensors file loads as is.

use candle_core::{Module, Result, Tensor};
use candle_nn as nn;
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    unet_2d_blocks::{
        CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, DownBlock2D, DownBlock2DConfig,
        UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
    },
};

#[derive(Debug, Clone, PartialEq)]
pub struct ControlNetConfig {
    pub in_channels: usize,
    pub conditioning_channels: usize,
    pub conditioning_embedding_out_channels: Vec<usize>,
    /// (output channels, uses cross attention) per down block
    pub blocks: Vec<(usize, bool)>,
    pub layers_per_block: usize,
    pub downsample_padding: usize,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub cross_attention_dim: usize,
    pub attention_head_dim: usize,
    pub use_linear_projection: bool,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
}

impl ControlNetConfig {
    /// `lllyasviel/sd-controlnet-canny`
    pub fn sd15() -> Self {
        Self {
            in_channels: 4,
            conditioning_channels: 3,
            conditioning_embedding_out_channels: vec![16, 32, 96, 256],
            blocks: vec![(320, true), (640, true), (1280, true), (1280, false)],
            layers_per_block: 2,
            downsample_padding: 1,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim: 768,
            attention_head_dim: 8,
            use_linear_projection: false,
            flip_sin_to_cos: true,
            freq_shift: 0.,
        }
    }

    /// Channel count of every skip connection, in the order the UNet
    /// produces them.
    pub fn residual_channels(&self) -> Vec<usize> {
        let mut channels = vec![self.blocks[0].0];
        let n_blocks = self.blocks.len();
        for (i, &(out_channels, _)) in self.blocks.iter().enumerate() {
            channels.extend(std::iter::repeat(out_channels).take(self.layers_per_block));
            if i < n_blocks - 1 {
                channels.push(out_channels);
            }
        }
        channels
    }
}

fn conv3x3(in_c: usize, out_c: usize, stride: usize, vs: nn::VarBuilder) -> Result<nn::Conv2d> {
    let cfg = nn::Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    nn::conv2d(in_c, out_c, 3, cfg, vs)
}

fn zero_conv(channels: usize, vs: nn::VarBuilder) -> Result<nn::Conv2d> {
    nn::conv2d(channels, channels, 1, Default::default(), vs)
}

/// Turns the pixel-space control image into a latent-resolution feature map.
#[derive(Debug)]
struct ConditioningEmbedding {
    conv_in: nn::Conv2d,
    blocks: Vec<(nn::Conv2d, nn::Conv2d)>,
    conv_out: nn::Conv2d,
}

impl ConditioningEmbedding {
    fn new(
        vs: nn::VarBuilder,
        conditioning_channels: usize,
        out_channels: &[usize],
        embedding_channels: usize,
    ) -> Result<Self> {
        let conv_in = conv3x3(conditioning_channels, out_channels[0], 1, vs.pp("conv_in"))?;
        let vs_b = vs.pp("blocks");
        let blocks = out_channels
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let (c_in, c_out) = (pair[0], pair[1]);
                Ok((
                    conv3x3(c_in, c_in, 1, vs_b.pp(2 * i))?,
                    conv3x3(c_in, c_out, 2, vs_b.pp(2 * i + 1))?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let last = *out_channels.last().unwrap_or(&conditioning_channels);
        let conv_out = conv3x3(last, embedding_channels, 1, vs.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.conv_in.forward(xs)?.silu()?;
        for (same, down) in &self.blocks {
            xs = same.forward(&xs)?.silu()?;
            xs = down.forward(&xs)?.silu()?;
        }
        self.conv_out.forward(&xs)
    }
}

#[derive(Debug)]
enum DownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

/// Residuals to add to the UNet skip connections and mid block.
#[derive(Debug)]
pub struct ControlResiduals {
    pub down: Vec<Tensor>,
    pub mid: Tensor,
}

#[derive(Debug)]
pub struct ControlNet {
    conv_in: nn::Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    down_zero_convs: Vec<nn::Conv2d>,
    mid_zero_conv: nn::Conv2d,
}

impl ControlNet {
    pub fn new(
        vs: nn::VarBuilder,
        config: &ControlNetConfig,
        use_flash_attn: bool,
    ) -> Result<Self> {
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].0;
        let bl_channels = config.blocks[n_blocks - 1].0;
        let time_embed_dim = b_channels * 4;

        let conv_in = conv3x3(config.in_channels, b_channels, 1, vs.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;
        let cond_embedding = ConditioningEmbedding::new(
            vs.pp("controlnet_cond_embedding"),
            config.conditioning_channels,
            &config.conditioning_embedding_out_channels,
            b_channels,
        )?;

        let vs_db = vs.pp("down_blocks");
        let down_blocks = config
            .blocks
            .iter()
            .enumerate()
            .map(|(i, &(out_channels, use_cross_attn))| {
                let in_channels = if i > 0 { config.blocks[i - 1].0 } else { b_channels };
                let db_cfg = DownBlock2DConfig {
                    num_layers: config.layers_per_block,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_downsample: i < n_blocks - 1,
                    downsample_padding: config.downsample_padding,
                    ..Default::default()
                };
                if use_cross_attn {
                    let cfg = CrossAttnDownBlock2DConfig {
                        downblock: db_cfg,
                        attn_num_head_channels: config.attention_head_dim,
                        cross_attention_dim: config.cross_attention_dim,
                        sliced_attention_size: None,
                        use_linear_projection: config.use_linear_projection,
                        ..Default::default()
                    };
                    let block = CrossAttnDownBlock2D::new(
                        vs_db.pp(i),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        use_flash_attn,
                        cfg,
                    )?;
                    Ok(DownBlock::CrossAttn(block))
                } else {
                    let block = DownBlock2D::new(
                        vs_db.pp(i),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        db_cfg,
                    )?;
                    Ok(DownBlock::Basic(block))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            resnet_groups: Some(config.norm_num_groups),
            attn_num_head_channels: config.attention_head_dim,
            cross_attn_dim: config.cross_attention_dim,
            use_linear_projection: config.use_linear_projection,
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vs.pp("mid_block"),
            bl_channels,
            Some(time_embed_dim),
            use_flash_attn,
            mid_cfg,
        )?;

        let vs_zc = vs.pp("controlnet_down_blocks");
        let down_zero_convs = config
            .residual_channels()
            .into_iter()
            .enumerate()
            .map(|(i, channels)| zero_conv(channels, vs_zc.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let mid_zero_conv = zero_conv(bl_channels, vs.pp("controlnet_mid_block"))?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            mid_block,
            down_zero_convs,
            mid_zero_conv,
        })
    }

    /// `xs` and `cond` carry the same batch (unconditional + conditional
    /// halves for classifier-free guidance).
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        cond: &Tensor,
        conditioning_scale: f64,
    ) -> Result<ControlResiduals> {
        let bsize = xs.dim(0)?;
        let emb = (Tensor::ones(bsize, xs.dtype(), xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;

        let xs = self.conv_in.forward(xs)?;
        let cond = self.cond_embedding.forward(cond)?;
        let mut xs = (xs + cond)?;

        let mut res_xs = vec![xs.clone()];
        for block in &self.down_blocks {
            let (next, block_res) = match block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?,
            };
            res_xs.extend(block_res);
            xs = next;
        }
        let mid = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        let down = res_xs
            .iter()
            .zip(&self.down_zero_convs)
            .map(|(res, conv)| conv.forward(res)? * conditioning_scale)
            .collect::<Result<Vec<_>>>()?;
        let mid = (self.mid_zero_conv.forward(&mid)? * conditioning_scale)?;
        Ok(ControlResiduals { down, mid })
    }
}
