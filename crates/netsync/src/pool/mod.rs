mod buffer;
mod object;
mod scaler;

pub use buffer::{BufferPool, DEFAULT_BUFFER_CAPACITY, PooledBuffer};
pub use object::ObjectPool;
pub use scaler::{
    PoolScaler, ScaleChange, ScalerStats, ScalingMode, MIN_SCALE_UP_INCREMENT,
    SCALE_DOWN_DELAY, SCALE_DOWN_THRESHOLD, SCALE_UP_THRESHOLD, UPDATE_INTERVAL,
};
