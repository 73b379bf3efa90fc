//! WAV (RIFF) reading for the file-backed media provider
//!
//! Handles PCM 16/24/32-bit and 32-bit float data chunks with any channel
//! count, decoding into planar [`AudioData`].

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::{AudioData, MediaError};
use crate::types::Sample;

/// Format description from the fmt chunk
#[derive(Debug, Clone)]
struct WavFormat {
    format_tag: u16,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    block_align: u16,
}

fn io_err(e: std::io::Error) -> MediaError {
    MediaError::Io(e.to_string())
}

/// Read and decode a whole WAV file.
pub fn read_wav(path: &Path) -> Result<AudioData, MediaError> {
    let file = File::open(path).map_err(io_err)?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 12];
    reader.read_exact(&mut header).map_err(io_err)?;
    if &header[0..4] != b"RIFF" {
        return Err(MediaError::InvalidFormat("not a RIFF file".into()));
    }
    if &header[8..12] != b"WAVE" {
        return Err(MediaError::InvalidFormat("not a WAVE file".into()));
    }

    let mut format: Option<WavFormat> = None;
    let mut data: Option<(u64, u32)> = None; // (offset, size)

    loop {
        let mut chunk_id = [0u8; 4];
        if reader.read_exact(&mut chunk_id).is_err() {
            break;
        }
        let mut size_bytes = [0u8; 4];
        reader.read_exact(&mut size_bytes).map_err(io_err)?;
        let chunk_size = u32::from_le_bytes(size_bytes);

        match &chunk_id {
            b"fmt " => {
                format = Some(read_fmt_chunk(&mut reader, chunk_size)?);
            }
            b"data" => {
                let offset = reader.stream_position().map_err(io_err)?;
                data = Some((offset, chunk_size));
                reader
                    .seek(SeekFrom::Current(chunk_size as i64))
                    .map_err(io_err)?;
            }
            _ => {
                reader
                    .seek(SeekFrom::Current(chunk_size as i64))
                    .map_err(io_err)?;
            }
        }

        // Chunks are word-aligned
        if chunk_size % 2 != 0 {
            reader.seek(SeekFrom::Current(1)).map_err(io_err)?;
        }
    }

    let format = format.ok_or(MediaError::InvalidFormat("missing fmt chunk".into()))?;
    let (data_offset, data_size) =
        data.ok_or(MediaError::InvalidFormat("missing data chunk".into()))?;
    if format.channels == 0 || format.block_align == 0 {
        return Err(MediaError::InvalidFormat("empty channel layout".into()));
    }

    reader.seek(SeekFrom::Start(data_offset)).map_err(io_err)?;
    decode_frames(&mut reader, &format, data_size)
}

fn read_fmt_chunk(reader: &mut BufReader<File>, size: u32) -> Result<WavFormat, MediaError> {
    if size < 16 {
        return Err(MediaError::InvalidFormat("fmt chunk too small".into()));
    }
    let mut fmt_data = vec![0u8; size as usize];
    reader.read_exact(&mut fmt_data).map_err(io_err)?;

    Ok(WavFormat {
        format_tag: u16::from_le_bytes([fmt_data[0], fmt_data[1]]),
        channels: u16::from_le_bytes([fmt_data[2], fmt_data[3]]),
        sample_rate: u32::from_le_bytes([fmt_data[4], fmt_data[5], fmt_data[6], fmt_data[7]]),
        block_align: u16::from_le_bytes([fmt_data[12], fmt_data[13]]),
        bits_per_sample: u16::from_le_bytes([fmt_data[14], fmt_data[15]]),
    })
}

fn decode_frames(
    reader: &mut BufReader<File>,
    format: &WavFormat,
    data_size: u32,
) -> Result<AudioData, MediaError> {
    let channels = format.channels as usize;
    let frame_count = (data_size as u64 / format.block_align as u64) as usize;
    let bytes_per_sample = (format.bits_per_sample / 8) as usize;

    let mut planar: Vec<Vec<Sample>> = vec![Vec::with_capacity(frame_count); channels];
    let mut frame = vec![0u8; channels * bytes_per_sample];

    for _ in 0..frame_count {
        reader.read_exact(&mut frame).map_err(io_err)?;
        for (ch, out) in planar.iter_mut().enumerate() {
            let b = &frame[ch * bytes_per_sample..(ch + 1) * bytes_per_sample];
            let value = match (format.bits_per_sample, format.format_tag) {
                (16, 1) => i16::from_le_bytes([b[0], b[1]]) as Sample / 32768.0,
                (24, 1) => {
                    let mut v = (b[0] as i32) | ((b[1] as i32) << 8) | ((b[2] as i32) << 16);
                    if v & 0x80_0000 != 0 {
                        v |= !0xFF_FFFF; // sign extend
                    }
                    v as Sample / 8_388_608.0
                }
                (32, 1) => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as Sample / 2_147_483_648.0,
                (32, 3) => Sample::from_le_bytes([b[0], b[1], b[2], b[3]]),
                (bits, _) => return Err(MediaError::UnsupportedBitDepth(bits)),
            };
            out.push(value);
        }
    }

    Ok(AudioData {
        channels: planar,
        sample_rate: format.sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Write a minimal 16-bit PCM WAV file for the reader tests.
    fn write_test_wav(path: &Path, channels: u16, sample_rate: u32, frames: &[Vec<i16>]) {
        let frame_count = frames.len();
        let block_align = channels * 2;
        let data_size = frame_count as u32 * block_align as u32;

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_size).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_size.to_le_bytes());
        for frame in frames {
            for &s in frame {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
        }

        let mut file = File::create(path).unwrap();
        file.write_all(&bytes).unwrap();
    }

    #[test]
    fn test_read_stereo_16bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_test_wav(
            &path,
            2,
            48_000,
            &[vec![16384, -16384], vec![0, 0], vec![32767, 32767]],
        );

        let data = read_wav(&path).unwrap();
        assert_eq!(data.channels.len(), 2);
        assert_eq!(data.sample_rate, 48_000);
        assert_eq!(data.frames(), 3);
        assert!((data.channels[0][0] - 0.5).abs() < 1e-3);
        assert!((data.channels[1][0] + 0.5).abs() < 1e-3);
        assert!((data.channels[0][2] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_read_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_test_wav(&path, 1, 44_100, &[vec![0], vec![8192]]);

        let data = read_wav(&path).unwrap();
        assert_eq!(data.channels.len(), 1);
        assert_eq!(data.frames(), 2);
    }

    #[test]
    fn test_reject_non_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.wav");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(matches!(read_wav(&path), Err(MediaError::InvalidFormat(_))));
    }
}
