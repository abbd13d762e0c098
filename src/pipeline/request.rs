//! Capture request parsed from HTTP parameters.

use serde::{Deserialize, Serialize};

use crate::capture::storage::sanitize_session;
use crate::capture::{FrameSize, PixelFormat};
use crate::Config;

/// One capture sequence as requested by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Already sanitized, see [`sanitize_session`].
    pub session: String,
    /// Always at least 1.
    pub frame_count: u32,
    pub frame_size: FrameSize,
    pub pixel_format: PixelFormat,
    /// Caller's estimate of the time needed to reach the start point, in µs.
    pub start_hint_us: Option<i64>,
}

/// Raw query/form parameters. Everything is optional and parsed leniently.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CaptureParams {
    pub session: Option<String>,
    pub frame_count: Option<String>,
    pub framesize: Option<String>,
    pub pixel_format: Option<String>,
    /// Milliseconds.
    pub cpu_time_to_start: Option<String>,
}

impl CaptureParams {
    /// Fill fields missing from `self` with those of `fallback`.
    pub fn or(self, fallback: CaptureParams) -> Self {
        Self {
            session: self.session.or(fallback.session),
            frame_count: self.frame_count.or(fallback.frame_count),
            framesize: self.framesize.or(fallback.framesize),
            pixel_format: self.pixel_format.or(fallback.pixel_format),
            cpu_time_to_start: self.cpu_time_to_start.or(fallback.cpu_time_to_start),
        }
    }
}

/// What a request gets when it leaves something out or asks for too much.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDefaults {
    pub frame_size: FrameSize,
    pub pixel_format: PixelFormat,
    pub max_frame_count: u32,
}

impl RequestDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame_size: config.camera.frame_size,
            pixel_format: config.camera.pixel_format,
            max_frame_count: config.sequence.max_frame_count,
        }
    }
}

impl CaptureRequest {
    /// Build a request, falling back to `defaults` for missing or unknown
    /// names. Non-positive or unparsable frame counts become 1; counts above
    /// `defaults.max_frame_count` are clamped to it.
    pub fn from_params(params: &CaptureParams, defaults: &RequestDefaults) -> Self {
        let max = defaults.max_frame_count.max(1);
        let frame_count = params
            .frame_count
            .as_deref()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|&n| n > 0)
            .map_or(1, |n| u32::try_from(n).unwrap_or(u32::MAX).min(max));

        let frame_size = params
            .framesize
            .as_deref()
            .and_then(FrameSize::parse)
            .unwrap_or(defaults.frame_size);
        let pixel_format = params
            .pixel_format
            .as_deref()
            .and_then(PixelFormat::parse)
            .unwrap_or(defaults.pixel_format);

        let start_hint_us = params
            .cpu_time_to_start
            .as_deref()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|ms| ms.saturating_mul(1000));

        Self {
            session: sanitize_session(params.session.as_deref().unwrap_or_default()),
            frame_count,
            frame_size,
            pixel_format,
            start_hint_us,
        }
    }

    /// Parameters to forward to the peer so it stages the same capture.
    pub fn to_params(&self) -> CaptureParams {
        CaptureParams {
            session: Some(self.session.clone()),
            frame_count: Some(self.frame_count.to_string()),
            framesize: Some(self.frame_size.to_string()),
            pixel_format: Some(self.pixel_format.to_string()),
            cpu_time_to_start: self.start_hint_us.map(|us| (us / 1000).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> CaptureParams {
        let mut p = CaptureParams::default();
        for (k, v) in pairs {
            let v = Some(v.to_string());
            match *k {
                "session" => p.session = v,
                "frame_count" => p.frame_count = v,
                "framesize" => p.framesize = v,
                "pixel_format" => p.pixel_format = v,
                "cpu_time_to_start" => p.cpu_time_to_start = v,
                _ => unreachable!(),
            }
        }
        p
    }

    const DEFAULTS: RequestDefaults = RequestDefaults {
        frame_size: FrameSize::Vga,
        pixel_format: PixelFormat::Jpeg,
        max_frame_count: 100,
    };

    fn parse(pairs: &[(&str, &str)]) -> CaptureRequest {
        CaptureRequest::from_params(&params(pairs), &DEFAULTS)
    }

    #[test]
    fn empty_params_use_defaults() {
        let req = parse(&[]);
        assert_eq!(req.session, "session");
        assert_eq!(req.frame_count, 1);
        assert_eq!(req.frame_size, FrameSize::Vga);
        assert_eq!(req.pixel_format, PixelFormat::Jpeg);
        assert_eq!(req.start_hint_us, None);
    }

    #[test]
    fn frame_count_floor_is_one() {
        assert_eq!(parse(&[("frame_count", "0")]).frame_count, 1);
        assert_eq!(parse(&[("frame_count", "-4")]).frame_count, 1);
        assert_eq!(parse(&[("frame_count", "abc")]).frame_count, 1);
        assert_eq!(parse(&[("frame_count", "12")]).frame_count, 12);
    }

    #[test]
    fn frame_count_is_capped() {
        assert_eq!(parse(&[("frame_count", "100")]).frame_count, 100);
        assert_eq!(parse(&[("frame_count", "101")]).frame_count, 100);
        assert_eq!(parse(&[("frame_count", "4294967295")]).frame_count, 100);
        assert_eq!(parse(&[("frame_count", "99999999999999")]).frame_count, 100);
    }

    #[test]
    fn known_names_override_defaults() {
        let req = parse(&[
            ("framesize", "SVGA"),
            ("pixel_format", "grayscale"),
            ("cpu_time_to_start", "250"),
            ("session", "take/one"),
        ]);
        assert_eq!(req.frame_size, FrameSize::Svga);
        assert_eq!(req.pixel_format, PixelFormat::Grayscale);
        assert_eq!(req.start_hint_us, Some(250_000));
        assert_eq!(req.session, "take_one");
    }

    #[test]
    fn body_fields_win_over_query() {
        let body = params(&[("frame_count", "4")]);
        let query = params(&[("frame_count", "9"), ("session", "q")]);
        let merged = body.or(query);
        assert_eq!(merged.frame_count.as_deref(), Some("4"));
        assert_eq!(merged.session.as_deref(), Some("q"));
    }

    #[test]
    fn unknown_names_fall_back() {
        let req = parse(&[("framesize", "8k"), ("pixel_format", "webp")]);
        assert_eq!(req.frame_size, FrameSize::Vga);
        assert_eq!(req.pixel_format, PixelFormat::Jpeg);
    }

    #[test]
    fn forwarded_params_reproduce_the_request() {
        let req = parse(&[("frame_count", "3"), ("framesize", "qvga"), ("session", "a")]);
        let other = RequestDefaults {
            frame_size: FrameSize::Uxga,
            pixel_format: PixelFormat::Rgb24,
            max_frame_count: 10,
        };
        let again = CaptureRequest::from_params(&req.to_params(), &other);
        assert_eq!(again, req);
    }
}
