//! Component C: TIFF read, JPEG render, and 1-D line-profile render.
//!
//! Ported from the original `mr.c` renderer. Two behaviors are
//! deliberately NOT "fixed" here, per this project's design notes: the
//! profile renderer's apparent x/y axis swap (`k` is derived from the
//! x-endpoints, `l` from the y-endpoints), and rows skipped by the
//! bounds check staying black rather than being omitted.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageBuffer, Rgb};
use std::fmt::Write as _;
use std::fs::File;
use std::io::BufReader;
use tiff::decoder::{Decoder, DecodingResult};

/// A decoded 16-bit grayscale image buffer, the renderer's only input
/// representation — shared by legacy TIFF sources and HDF5 frames alike.
pub struct RenderImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u16>,
}

pub fn read_tiff(path: &str) -> Result<RenderImage> {
    let file = File::open(path).map_err(|e| anyhow!("failed to open tiff {}: {}", path, e))?;
    let mut decoder =
        Decoder::new(BufReader::new(file)).map_err(|e| anyhow!("invalid tiff {}: {}", path, e))?;
    let (width, height) = decoder
        .dimensions()
        .map_err(|e| anyhow!("failed to read tiff dimensions: {}", e))?;
    let image = decoder
        .read_image()
        .map_err(|e| anyhow!("failed to decode tiff {}: {}", path, e))?;
    let data = match image {
        DecodingResult::U16(v) => v,
        DecodingResult::U8(v) => v.into_iter().map(u16::from).collect(),
        _ => return Err(anyhow!("unsupported tiff sample format in {}", path)),
    };
    Ok(RenderImage {
        width: width as usize,
        height: height as usize,
        data,
    })
}

/// Parameters shared by both render operations, lifted directly off a
/// [`crate::request::RequestDescriptor`].
#[derive(Debug, Clone, Copy)]
pub struct ViewRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ContrastWindow {
    pub wval: u32,
    pub contrast: u32,
}

fn nearest_value(img: &RenderImage, k: f64, l: f64) -> u16 {
    let row = (k + 0.5) as i64;
    let col = (l + 0.5) as i64;
    sample(img, row, col)
}

fn sample(img: &RenderImage, row: i64, col: i64) -> u16 {
    if row < 0 || col < 0 || row as usize >= img.height || col as usize >= img.width {
        return 0;
    }
    img.data[row as usize * img.width + col as usize]
}

/// Maximum pixel value in the box `[k-yal, k+yau) x [l-xal, l+xau)`. The
/// loop variable starts at a truncated integer bound but is compared
/// against the *untruncated* upper bound on every iteration, exactly as
/// the original's `for(m=k-yal; m<k+yau; m++)` compares its integer loop
/// variable against a double upper bound — these differ whenever
/// `k+yau`/`l+xau` is non-integer.
fn max_box(img: &RenderImage, k: f64, l: f64, yal: f64, yau: f64, xal: f64, xau: f64) -> u16 {
    let row_start = (k - yal) as i64;
    let row_end = k + yau;
    let col_start = (l - xal) as i64;
    let col_end = l + xau;
    let mut max = 0u16;
    let mut row = row_start;
    while (row as f64) < row_end {
        let mut col = col_start;
        while (col as f64) < col_end {
            let value = sample(img, row, col);
            if value > max {
                max = value;
            }
            col += 1;
        }
        row += 1;
    }
    max
}

/// Contrast-map one raw pixel value to an output grayscale level, with
/// the saturation sentinel overridden to pure red. Returns `(r, g, b)`.
fn apply_contrast(d: u16, window: ContrastWindow) -> (u8, u8, u8) {
    if d == 65535 {
        return (255, 0, 0);
    }
    let wval = window.wval;
    let contrast = window.contrast.max(wval + 1);
    let d = d as u32;
    let rslt = d.saturating_sub(wval).saturating_mul(255);
    let dout = (rslt / (contrast - wval)).min(255) as u8;
    let inverted = 255 - dout;
    (inverted, inverted, inverted)
}

/// Component C, JPEG branch: contrast-adjusted, max-pooled-or-nearest
/// downscale (or 1:1 sampling) of a `view` rectangle of `img` into an
/// `xsize x ysize` output JPEG.
pub fn render_jpeg(
    img: &RenderImage,
    view: ViewRect,
    xsize: u32,
    ysize: u32,
    window: ContrastWindow,
) -> Result<Vec<u8>> {
    let xsize = xsize as usize;
    let ysize = ysize as usize;
    if xsize == 0 || ysize == 0 {
        return Err(anyhow!("output size must be non-zero in both dimensions"));
    }

    let ya = (view.height as usize) / ysize;
    let xa = (view.width as usize) / xsize;
    let (yal, yau) = split_box(ya);
    let (xal, xau) = split_box(xa);

    let jmin_raw = -(view.x) * (xsize as f64) / view.width + xal as f64;
    let jmax_raw = (img.width as f64 - view.x) * (xsize as f64) / view.width - xau as f64 + 1.0;
    let jmin = (jmin_raw as i64).clamp(0, xsize as i64) as usize;
    let jmax = (jmax_raw as i64).clamp(0, xsize as i64) as usize;

    let mut buffer: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::new(xsize as u32, ysize as u32);

    for i in 0..ysize {
        let k = (i as f64 * view.height) / ysize as f64 + view.y;
        let row_skipped = k - yal as f64 < -0.5 || k + yau as f64 >= img.height as f64 - 0.5;
        if row_skipped {
            continue; // row stays zeroed/black, matching the calloc'd output buffer
        }
        for j in jmin..jmax {
            let l = (j as f64 * view.width) / xsize as f64 + view.x;
            let d = if ya <= 1 && xa <= 1 {
                nearest_value(img, k, l)
            } else {
                max_box(img, k, l, yal as f64, yau as f64, xal as f64, xau as f64)
            };
            let (r, g, b) = apply_contrast(d, window);
            buffer.put_pixel(j as u32, i as u32, Rgb([r, g, b]));
        }
    }

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, 100);
    encoder
        .encode(buffer.as_raw(), xsize as u32, ysize as u32, ColorType::Rgb8)
        .map_err(|e| anyhow!("jpeg encode failed: {}", e))?;
    Ok(out)
}

fn split_box(a: usize) -> (usize, usize) {
    let al = a / 2;
    let mut au = a / 2;
    if al + au < a {
        au += 1;
    }
    (al, au)
}

/// Component C, profile branch: samples `n` points along the segment
/// from `(pax, pay)` to `(pbx, pby)`, where `n = floor(|segment|) + 1`.
/// `k` is derived from the x-endpoints and `l` from the y-endpoints —
/// an intentional axis swap carried over unchanged from the original.
pub fn render_profile(
    img: &RenderImage,
    pax: f64,
    pay: f64,
    pbx: f64,
    pby: f64,
) -> Result<String> {
    let dx = pbx - pax;
    let dy = pby - pay;
    let n = ((dx * dx + dy * dy).sqrt() as i64 + 1).max(1) as usize;

    let mk = dx / n as f64;
    let bk = pax;
    let ml = dy / n as f64;
    let bl = pay;

    let mut samples = vec![0u16; n];
    let mut max_value: u16 = 0;
    let mut min_value: u16 = u16::MAX;

    for (s, slot) in samples.iter_mut().enumerate() {
        let k = mk * s as f64 + bk;
        let l = ml * s as f64 + bl;
        let row = (k + 0.5) as i64;
        let col = (l + 0.5) as i64;
        let value = if row >= 0
            && (row as usize) < img.height
            && col >= 0
            && (col as usize) < img.width
        {
            sample(img, row, col)
        } else {
            0
        };
        *slot = value;
        if value > max_value {
            max_value = value;
        }
        if value < min_value {
            min_value = value;
        }
    }

    let mut xml = String::new();
    write!(
        xml,
        "<data xMin=\"0\" xMax=\"{}\" yMin=\"{}\" yMax=\"{}\">",
        n, min_value, max_value
    )
    .unwrap();
    for (s, value) in samples.iter().enumerate() {
        write!(xml, "<point x=\"{}\" y=\"{}\"/>", s, value).unwrap();
    }
    xml.push_str("</data>");
    Ok(xml)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(width: usize, height: usize, fill: impl Fn(usize, usize) -> u16) -> RenderImage {
        let mut data = vec![0u16; width * height];
        for y in 0..height {
            for x in 0..width {
                data[y * width + x] = fill(x, y);
            }
        }
        RenderImage {
            width,
            height,
            data,
        }
    }

    #[test]
    fn saturated_pixel_renders_pure_red() {
        assert_eq!(
            apply_contrast(65535, ContrastWindow { wval: 0, contrast: 1000 }),
            (255, 0, 0)
        );
    }

    #[test]
    fn contrast_mapping_is_monotonic_below_saturation() {
        let window = ContrastWindow {
            wval: 10,
            contrast: 1000,
        };
        let (low, _, _) = apply_contrast(100, window);
        let (high, _, _) = apply_contrast(900, window);
        // inverted grayscale: higher raw value -> darker (smaller) output byte
        assert!(high <= low);
    }

    #[test]
    fn eight_by_eight_identity_render_produces_well_formed_jpeg() {
        let img = test_image(8, 8, |x, y| ((x + y) * 1000) as u16);
        let view = ViewRect {
            x: 0.0,
            y: 0.0,
            width: 8.0,
            height: 8.0,
        };
        let window = ContrastWindow {
            wval: 0,
            contrast: 8000,
        };
        let jpeg = render_jpeg(&img, view, 8, 8, window).expect("render should succeed");
        assert!(jpeg.len() > 2);
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]); // JPEG SOI marker
    }

    #[test]
    fn downscale_uses_max_pooling() {
        let mut img = test_image(8, 8, |_, _| 0);
        img.data[3 * 8 + 3] = 65534; // a single bright pixel inside one 4x4 box
        let view = ViewRect {
            x: 0.0,
            y: 0.0,
            width: 8.0,
            height: 8.0,
        };
        let window = ContrastWindow {
            wval: 0,
            contrast: 65535,
        };
        let jpeg = render_jpeg(&img, view, 2, 2, window).expect("render should succeed");
        assert!(!jpeg.is_empty());
    }

    #[test]
    fn max_box_includes_pixel_at_untruncated_upper_bound_for_non_power_of_two_scale() {
        // height=10, ysize=3 -> ya=3, split_box(3) = (yal=1, yau=2). At
        // row i=1, k = 10/3 = 3.3333..., so k+yau = 5.3333...: the box's
        // upper row bound is non-integer, and row=5 is inside it
        // (5 < 5.333...) even though truncating 5.333... to 5 first and
        // comparing `row < 5` would wrongly exclude it. Same reasoning
        // applies to the column bound.
        let mut img = test_image(10, 10, |_, _| 0);
        img.data[5 * 10 + 5] = 65534;
        let k = 10.0_f64 / 3.0;
        let value = max_box(&img, k, k, 1.0, 2.0, 1.0, 2.0);
        assert_eq!(value, 65534);
    }

    #[test]
    fn ten_by_ten_to_three_by_three_downscale_picks_up_edge_of_box() {
        let mut img = test_image(10, 10, |_, _| 0);
        img.data[5 * 10 + 5] = 65534;
        let view = ViewRect {
            x: 0.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
        };
        let window = ContrastWindow {
            wval: 0,
            contrast: 65535,
        };
        let jpeg = render_jpeg(&img, view, 3, 3, window).expect("render should succeed");
        assert!(!jpeg.is_empty());
    }

    #[test]
    fn diagonal_profile_samples_expected_count() {
        let img = test_image(10, 10, |x, y| (x * 10 + y) as u16);
        let xml = render_profile(&img, 0.0, 0.0, 9.0, 9.0).expect("profile should succeed");
        assert!(xml.starts_with("<data"));
        assert!(xml.contains("xMax=\"13\""));
        assert_eq!(xml.matches("<point").count(), 13);
    }
}
