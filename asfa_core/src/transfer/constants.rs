/// Buffer size for local copies (1MB)
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// Pick the copy buffer: the whole file when it is smaller than one buffer
pub fn chunk_size(declared_size: u64) -> usize {
    if declared_size > 0 {
        declared_size.min(BUFFER_SIZE as u64) as usize
    } else {
        BUFFER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size() {
        assert_eq!(chunk_size(0), BUFFER_SIZE);
        assert_eq!(chunk_size(10), 10);
        assert_eq!(chunk_size(50 * 1024 * 1024), BUFFER_SIZE);
    }
}
