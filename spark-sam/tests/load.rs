mod common;

use common::{model_writer, save, tiny_hparams};
use spark_sam::{LoadError, SamError, SamModel, SamSession};

#[test]
fn synthetic_model_loads() -> anyhow::Result<()> {
    common::init_logging();
    let hparams = tiny_hparams();
    let (_dir, path) = save(&model_writer(&hparams, 1))?;

    let model = SamModel::load(&path)?;
    assert_eq!(model.hparams, hparams);
    assert_eq!(model.enc_img.layers.len(), 2);
    assert_eq!(model.dec.transformer_layers.len(), 2);
    assert_eq!(model.dec.output_hypernet_mlps.len(), 4);
    assert_eq!(model.image_pe().dim(), (4, 4, 16));
    Ok(())
}

#[test]
fn missing_tensor_is_named() -> anyhow::Result<()> {
    let mut writer = model_writer(&tiny_hparams(), 1);
    assert!(writer.remove("mask_decoder.iou_token.weight"));
    let (_dir, path) = save(&writer)?;

    match SamModel::load(&path) {
        Err(LoadError::MissingTensor(name)) => assert_eq!(name, "mask_decoder.iou_token.weight"),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn wrong_shape_is_rejected() -> anyhow::Result<()> {
    let mut writer = model_writer(&tiny_hparams(), 1);
    writer.remove("image_encoder.blocks.1.attn.rel_pos_h");
    writer.add(
        "image_encoder.blocks.1.attn.rel_pos_h",
        ndarray::ArrayD::zeros(ndarray::IxDyn(&[5, 16])),
    );
    let (_dir, path) = save(&writer)?;

    assert!(matches!(
        SamModel::load(&path),
        Err(LoadError::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn f16_weights_are_widened() -> anyhow::Result<()> {
    let hparams = tiny_hparams();
    let mut writer = model_writer(&hparams, 3);
    writer.remove("prompt_encoder.no_mask_embed.weight");
    let values = ndarray::ArrayD::from_shape_vec(
        ndarray::IxDyn(&[1, 16]),
        (0..16).map(|i| i as f32 * 0.25).collect(),
    )?;
    writer.add_f16("prompt_encoder.no_mask_embed.weight", values.clone());
    let (_dir, path) = save(&writer)?;

    let model = SamModel::load(&path)?;
    assert_eq!(model.weight(model.enc_prompt.no_mask_embd_w), &values);
    Ok(())
}

#[test]
fn session_load_reports_missing_files() {
    let result = SamSession::load("/nonexistent/sam.bin", 1);
    assert!(matches!(result, Err(SamError::Load(LoadError::Io(_)))));
}
