mod filemanager;
mod mock;
