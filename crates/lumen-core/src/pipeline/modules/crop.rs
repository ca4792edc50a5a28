use crate::image_buf::ImageBuf;
use crate::snapshot::CropRect;

/// Copy the rows covered by `rect` out of `input`.
pub fn crop(input: &ImageBuf, rect: &CropRect) -> ImageBuf {
    if rect.is_full_frame() || input.is_empty() {
        return input.clone();
    }

    let (src_x, src_y, dst_w, dst_h) = rect.to_pixels(input.width, input.height);
    let c = input.channels();
    let stride = input.row_stride();
    let mut data = Vec::with_capacity(dst_w as usize * dst_h as usize * c);

    for row in src_y..(src_y + dst_h) {
        let row_start = row as usize * stride + src_x as usize * c;
        let row_end = row_start + dst_w as usize * c;
        data.extend_from_slice(&input.data[row_start..row_end]);
    }

    ImageBuf {
        width: dst_w,
        height: dst_h,
        layout: input.layout,
        data,
    }
}
