// Copyright (C) 2025 spscbuf contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpscBufError {
    #[error("ring capacity must be a power of two, got {0}")]
    CapacityNotPowerOfTwo(usize),

    #[error("buffer address {addr:#x} is not aligned to the cache line size ({required} bytes)")]
    BufferMisaligned { addr: usize, required: usize },

    #[error("compiled for {compiled}-byte cache lines but this cpu reports {probed}-byte lines")]
    CacheLineMismatch { compiled: usize, probed: usize },

    #[error("writer and reader handles belong to different rings")]
    HandleMismatch,

    #[error("memory mapping failed: {0}")]
    MmapFailed(#[from] nix::errno::Errno),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
