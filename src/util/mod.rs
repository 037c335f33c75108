pub mod frame_size;
